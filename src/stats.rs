//! Чтение накопительных счётчиков трафика из stats-API xray.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

/// Сырые счётчики за всё время работы демона. Счётчики обнуляются при
/// рестарте xray, поэтому значения не монотонны между опросами.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub uplink_bytes: i64,
    pub downlink_bytes: i64,
}

/// Источник счётчиков трафика по имени пользователя. Каждое направление
/// независимо: сбой чтения одного даёт 0 и не отменяет второе.
#[async_trait]
pub trait TrafficCounterReader: Send + Sync {
    async fn read(&self, username: &str) -> TrafficSnapshot;
}

pub struct XrayStatsClient {
    api_server: String,
}

impl XrayStatsClient {
    pub fn new(api_server: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
        }
    }

    async fn query_counter(&self, username: &str, direction: &str) -> i64 {
        let pattern = format!("user>>>{}>>>traffic>>>{}", username, direction);
        let output = Command::new("xray")
            .arg("api")
            .arg("statsquery")
            .arg(format!("--server={}", self.api_server))
            .arg(format!("--pattern={}", pattern))
            .arg("--reset=false")
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(error) => {
                tracing::warn!(
                    username = username,
                    direction = direction,
                    error = %error,
                    "Не удалось запустить xray api statsquery"
                );
                return 0;
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("StatsService is not found") {
            tracing::error!(
                username = username,
                "StatsService не включён в конфигурации xray, счётчики недоступны"
            );
            return 0;
        }
        if !output.status.success() {
            tracing::warn!(
                username = username,
                direction = direction,
                stderr = %stderr.trim(),
                "statsquery завершился с ошибкой"
            );
            return 0;
        }

        match parse_stats_value(&String::from_utf8_lossy(&output.stdout), &pattern) {
            Some(value) => value,
            None => {
                // Пустой ответ означает, что у пользователя ещё нет трафика.
                tracing::debug!(
                    username = username,
                    direction = direction,
                    "statsquery не вернул счётчик"
                );
                0
            }
        }
    }
}

/// Разбирает ответ `{"stat":[{"name":...,"value":...}]}`; value приходит
/// строкой либо числом в зависимости от версии xray.
fn parse_stats_value(raw: &str, pattern: &str) -> Option<i64> {
    let parsed: Value = serde_json::from_str(raw.trim()).ok()?;
    let stat = parsed.get("stat")?.as_array()?.first()?;
    if stat.get("name")?.as_str()? != pattern {
        return None;
    }
    let value = stat.get("value")?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()))
}

#[async_trait]
impl TrafficCounterReader for XrayStatsClient {
    async fn read(&self, username: &str) -> TrafficSnapshot {
        TrafficSnapshot {
            uplink_bytes: self.query_counter(username, "uplink").await,
            downlink_bytes: self.query_counter(username, "downlink").await,
        }
    }
}
