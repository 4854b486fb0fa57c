//! Разбор access-лога xray: какие адреса видел каждый пользователь
//! за последние минуты.

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Источник свежих IP-адресов по пользователям. Карта пересобирается
/// заново при каждом вызове.
#[async_trait]
pub trait LogTailScanner: Send + Sync {
    async fn recent_ips(&self, window: Duration) -> HashMap<String, Vec<String>>;
}

#[derive(Debug, PartialEq, Eq)]
struct AccessEntry {
    timestamp: NaiveDateTime,
    address: String,
    username: String,
}

/// Строка вида
/// `2024/01/02 15:04:05 from 203.0.113.7:51324 accepted tcp:host:443 [tag] email: alice`.
/// Поддерживается и вариант с `user:` вместо `email:`.
fn parse_access_line(line: &str) -> Option<AccessEntry> {
    let stamp = line.get(..19)?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, "%Y/%m/%d %H:%M:%S").ok()?;

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let accepted_at = tokens.iter().position(|token| *token == "accepted")?;
    let addr_port = tokens.get(accepted_at.checked_sub(1)?)?;

    let (addr, port) = addr_port.rsplit_once(':')?;
    if addr.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !addr
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':')
    {
        return None;
    }
    // Голый IPv6 приводится к форме в квадратных скобках.
    let address = if addr.contains(':') && !addr.starts_with('[') {
        format!("[{}]", addr)
    } else {
        addr.to_string()
    };

    let username = tokens
        .iter()
        .position(|token| *token == "email:" || *token == "user:")
        .and_then(|at| tokens.get(at + 1))?;

    Some(AccessEntry {
        timestamp,
        address,
        username: username.to_string(),
    })
}

pub struct AccessLogScanner {
    path: PathBuf,
}

impl AccessLogScanner {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl LogTailScanner for AccessLogScanner {
    async fn recent_ips(&self, window: Duration) -> HashMap<String, Vec<String>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %error,
                    "Access-лог недоступен, пропускаю проход"
                );
                return HashMap::new();
            }
        };

        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(5));
        let now = Local::now();
        let lines: Vec<&str> = raw.lines().collect();
        let mut per_user: HashMap<String, BTreeSet<String>> = HashMap::new();

        // Идём с хвоста; свежие записи лежат в конце. Старая строка в
        // пределах 100 строк от хвоста ещё не граница — лог пишется не
        // строго по времени; дальше неё сканировать смысла нет.
        for (offset, line) in lines.iter().rev().enumerate() {
            let Some(entry) = parse_access_line(line) else {
                continue;
            };
            let local = match entry.timestamp.and_local_timezone(Local) {
                chrono::LocalResult::Single(local) => local,
                chrono::LocalResult::Ambiguous(earliest, _) => earliest,
                chrono::LocalResult::None => continue,
            };
            if now.signed_duration_since(local) > window {
                if offset >= 100 {
                    break;
                }
                continue;
            }
            per_user
                .entry(entry.username)
                .or_default()
                .insert(entry.address);
        }

        per_user
            .into_iter()
            .map(|(username, ips)| (username, ips.into_iter().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn parses_email_variant_with_ipv4() {
        let line = "2024/01/02 15:04:05 from 203.0.113.7:51324 accepted tcp:example.com:443 [vless-ws >> direct] email: alice";
        let entry = parse_access_line(line).unwrap();
        assert_eq!(entry.address, "203.0.113.7");
        assert_eq!(entry.username, "alice");
        assert_eq!(
            entry.timestamp,
            NaiveDateTime::parse_from_str("2024/01/02 15:04:05", "%Y/%m/%d %H:%M:%S").unwrap()
        );
    }

    #[test]
    fn parses_user_variant_and_brackets_ipv6() {
        let line = "2024/01/02 15:04:05 from 2001:db8::7:51324 accepted tcp:example.com:443 user: bob";
        let entry = parse_access_line(line).unwrap();
        assert_eq!(entry.address, "[2001:db8::7]");
        assert_eq!(entry.username, "bob");
    }

    #[test]
    fn ignores_lines_without_accepted_or_user() {
        assert!(parse_access_line("2024/01/02 15:04:05 rejected something").is_none());
        assert!(
            parse_access_line("2024/01/02 15:04:05 from 1.2.3.4:11 accepted tcp:host:443").is_none()
        );
        assert!(parse_access_line("garbage").is_none());
    }

    fn temp_log_path() -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "xray-admin-access-test-{}-{}.log",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn log_line(ts: chrono::DateTime<Local>, ip: &str, user: &str) -> String {
        format!(
            "{} from {}:40000 accepted tcp:example.com:443 [vless-ws >> direct] email: {}",
            ts.format("%Y/%m/%d %H:%M:%S"),
            ip,
            user
        )
    }

    #[tokio::test]
    async fn collects_distinct_recent_ips_per_user() {
        let path = temp_log_path();
        let now = Local::now();
        let old = now - chrono::Duration::hours(3);

        let mut lines = Vec::new();
        // Старый пласт далеко от хвоста, чтобы сработала отсечка.
        for i in 0..120 {
            lines.push(log_line(old, &format!("198.51.100.{}", i % 250), "stale"));
        }
        lines.push(log_line(now - chrono::Duration::minutes(1), "203.0.113.1", "alice"));
        lines.push(log_line(now - chrono::Duration::minutes(1), "203.0.113.2", "alice"));
        lines.push(log_line(now, "203.0.113.1", "alice"));
        lines.push(log_line(now, "192.0.2.9", "bob"));
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let scanner = AccessLogScanner::new(&path);
        let map = scanner.recent_ips(Duration::from_secs(300)).await;

        assert_eq!(
            map.get("alice").unwrap(),
            &vec!["203.0.113.1".to_string(), "203.0.113.2".to_string()]
        );
        assert_eq!(map.get("bob").unwrap(), &vec!["192.0.2.9".to_string()]);
        assert!(!map.contains_key("stale"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_log_returns_empty_map() {
        let scanner = AccessLogScanner::new("/nonexistent/xray-access.log");
        let map = scanner.recent_ips(Duration::from_secs(300)).await;
        assert!(map.is_empty());
    }
}
