//! Журнал аудита: по одной JSON-строке на событие, запись best-effort.

use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Дописывает событие в журнал. Ошибка записи логируется и не
    /// прерывает вызывающую операцию.
    pub async fn record(&self, action: &str, details: Value) {
        let mut entry = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "action": action,
        });
        if let (Some(entry_map), Value::Object(details_map)) = (entry.as_object_mut(), details) {
            for (key, value) in details_map {
                entry_map.insert(key, value);
            }
        }

        let mut line = entry.to_string();
        line.push('\n');
        if let Err(error) = self.append(line.as_bytes()).await {
            tracing::warn!(
                path = %self.path.display(),
                action = action,
                error = %error,
                "Не удалось записать событие аудита"
            );
        }
    }

    async fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_log_path() -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "xray-admin-audit-test-{}-{}.log",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[tokio::test]
    async fn records_json_lines_with_details() {
        let path = temp_log_path();
        let audit = AuditLog::new(&path);
        audit
            .record("USER_DELETED_FROM_SYSTEM", json!({"username": "alice", "reason": "expired_cleanup"}))
            .await;
        audit.record("QUOTA_CHECK_JOB_STARTED", json!({})).await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "USER_DELETED_FROM_SYSTEM");
        assert_eq!(first["username"], "alice");
        assert_eq!(first["reason"], "expired_cleanup");
        assert!(first["timestamp"].is_string());

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["action"], "QUOTA_CHECK_JOB_STARTED");

        let _ = tokio::fs::remove_file(&path).await;
    }
}
