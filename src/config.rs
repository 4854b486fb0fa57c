//! Загрузка TOML-конфигурации демона.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Токен бота для отправки уведомлений. Может быть задан через
    /// переменную окружения TELOXIDE_TOKEN вместо файла.
    pub bot_token: Option<String>,
    pub admin_ids: Vec<i64>,
    pub db_path: PathBuf,
    pub xray_config_path: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_access_log_path")]
    pub access_log_path: PathBuf,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Групповой чат для уведомлений; без него рассылка идёт по admin_ids.
    pub notification_group_id: Option<i64>,
    pub notification_topic_id: Option<i32>,
    #[serde(default = "default_max_users")]
    pub max_users: i64,
    #[serde(default)]
    pub quota: QuotaSettings,
    #[serde(default)]
    pub ip_monitor: IpMonitorSettings,
    #[serde(default)]
    pub reaper: ReaperSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub enabled: bool,
    pub check_interval_minutes: u64,
    /// Адрес stats-API xray для `xray api statsquery`.
    pub api_server: String,
    /// Пауза между пользователями внутри одного прохода.
    pub per_account_delay_ms: u64,
    pub notify_on_exceed: bool,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_minutes: 1,
            api_server: "127.0.0.1:10000".to_string(),
            per_account_delay_ms: 300,
            notify_on_exceed: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpMonitorSettings {
    pub max_ip_limit: usize,
    pub warning_threshold: i64,
    pub clean_checks_reset: i64,
    pub interval_minutes: u64,
    pub window_minutes: u64,
    pub warning_cooldown_minutes: i64,
}

impl Default for IpMonitorSettings {
    fn default() -> Self {
        Self {
            max_ip_limit: 4,
            warning_threshold: 3,
            clean_checks_reset: 2,
            interval_minutes: 5,
            window_minutes: 5,
            warning_cooldown_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub enabled: bool,
    /// Локальное время ежедневного прохода.
    pub run_hour: u32,
    pub run_minute: u32,
    pub notify_admins: bool,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            run_hour: 3,
            run_minute: 0,
            notify_admins: true,
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/usr/local/etc/xray/backups")
}

fn default_access_log_path() -> PathBuf {
    PathBuf::from("/var/log/xray/access.log")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/xray-admin-audit.log")
}

fn default_service_name() -> String {
    "xray".to_string()
}

fn default_max_users() -> i64 {
    2000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Не удалось прочитать конфиг {}: {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Некорректный конфиг {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn bot_token(&self) -> Result<String, anyhow::Error> {
        if let Some(token) = self.bot_token.as_deref()
            && !token.trim().is_empty()
        {
            return Ok(token.trim().to_string());
        }
        std::env::var("TELOXIDE_TOKEN")
            .map_err(|_| anyhow::anyhow!("bot_token не задан ни в конфиге, ни в TELOXIDE_TOKEN"))
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}
