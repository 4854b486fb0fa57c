//! Управление systemd-сервисом xray.

use async_trait::async_trait;
use tokio::process::Command;

/// Сигнал перезапуска внешнего демона после правки конфигурации.
#[async_trait]
pub trait ServiceReload: Send + Sync {
    async fn reload(&self) -> ServiceResult;
}

#[derive(Debug, Clone)]
pub struct ServiceController {
    service_name: String,
}

#[derive(Debug)]
pub struct ServiceResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ServiceController {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    async fn run_systemctl(&self, action: &str) -> ServiceResult {
        tracing::info!(
            action = action,
            service = %self.service_name,
            "Running systemctl command"
        );
        let output = Command::new("systemctl")
            .arg(action)
            .arg(&self.service_name)
            .output()
            .await;

        match output {
            Ok(o) => {
                let result = ServiceResult {
                    success: o.status.success(),
                    stdout: String::from_utf8_lossy(&o.stdout).trim().to_string(),
                    stderr: String::from_utf8_lossy(&o.stderr).trim().to_string(),
                };
                if result.success {
                    tracing::info!(
                        action = action,
                        service = %self.service_name,
                        "systemctl finished successfully"
                    );
                } else {
                    tracing::warn!(
                        action = action,
                        service = %self.service_name,
                        stderr = %result.stderr,
                        "systemctl returned non-zero status"
                    );
                }
                result
            }
            Err(e) => ServiceResult {
                success: false,
                stdout: String::new(),
                stderr: {
                    tracing::error!(
                        action = action,
                        service = %self.service_name,
                        error = %e,
                        "Failed to execute systemctl"
                    );
                    format!("Ошибка запуска systemctl: {}", e)
                },
            },
        }
    }

    pub async fn restart(&self) -> ServiceResult {
        self.run_systemctl("restart").await
    }
}

#[async_trait]
impl ServiceReload for ServiceController {
    /// Применение изменений конфигурации требует полного рестарта xray.
    async fn reload(&self) -> ServiceResult {
        self.restart().await
    }
}
