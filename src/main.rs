//! xray-admin — учёт трафика, контроль IP и жизненный цикл пользователей xray.

mod access_log;
mod audit;
mod config;
mod error;
mod format;
mod ip_monitor;
mod lifecycle;
mod notify;
mod quota;
mod reaper;
mod service;
mod stats;
mod store;
mod xray_cfg;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/xray-admin.toml"));
    tracing::info!(
        "Starting xray-admin with config {}",
        config_path.display()
    );

    let config = Arc::new(config::Config::load(&config_path)?);
    let token = config.bot_token()?;
    tracing::info!(
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        xray_config_path = %config.xray_config_path.display(),
        service_name = %config.service_name,
        max_users = config.max_users,
        quota_enabled = config.quota.enabled,
        "Configuration loaded"
    );

    let store = Arc::new(store::Store::open(&config.db_path).await?);
    let xray = Arc::new(xray_cfg::XrayConfigFile::new(
        &config.xray_config_path,
        &config.backup_dir,
    ));
    let service: Arc<dyn service::ServiceReload> =
        Arc::new(service::ServiceController::new(&config.service_name));
    let audit = audit::AuditLog::new(&config.audit_log_path);

    let bot = Bot::new(token);
    let notifier: Arc<dyn notify::NotificationSink> = Arc::new(notify::TelegramNotifier::new(
        bot,
        config.notification_group_id,
        config.notification_topic_id,
        config.admin_ids.clone(),
    ));

    let lifecycle = Arc::new(lifecycle::LifecycleManager::new(
        store.clone(),
        xray.clone(),
        service.clone(),
        audit.clone(),
        config.max_users,
        config.quota.enabled,
    ));

    if config.quota.enabled && config.quota.check_interval_minutes > 0 {
        let reconciler = Arc::new(quota::QuotaReconciler::new(
            store.clone(),
            Arc::new(stats::XrayStatsClient::new(&config.quota.api_server)),
            lifecycle.clone(),
            notifier.clone(),
            audit.clone(),
            Duration::from_millis(config.quota.per_account_delay_ms),
            config.quota.notify_on_exceed,
        ));
        let interval = Duration::from_secs(config.quota.check_interval_minutes * 60);
        tokio::spawn(reconciler.run(interval));
        tracing::info!(
            interval_minutes = config.quota.check_interval_minutes,
            "Quota reconciliation enabled"
        );
    } else if config.quota.enabled {
        tracing::warn!(
            "Квоты включены, но интервал проверки нулевой: автоматическая сверка не запущена"
        );
    }

    let monitor = Arc::new(ip_monitor::IpViolationMonitor::new(
        store.clone(),
        Arc::new(access_log::AccessLogScanner::new(&config.access_log_path)),
        lifecycle.clone(),
        notifier.clone(),
        audit.clone(),
        ip_monitor::IpPolicy {
            max_ip_limit: config.ip_monitor.max_ip_limit,
            warning_threshold: config.ip_monitor.warning_threshold,
            clean_checks_reset: config.ip_monitor.clean_checks_reset,
            window: Duration::from_secs(config.ip_monitor.window_minutes * 60),
            warning_cooldown_secs: config.ip_monitor.warning_cooldown_minutes * 60,
        },
    ));
    tokio::spawn(monitor.run(Duration::from_secs(config.ip_monitor.interval_minutes * 60)));

    if config.reaper.enabled {
        let reaper = Arc::new(reaper::ExpiryReaper::new(
            store.clone(),
            lifecycle.clone(),
            notifier.clone(),
            audit.clone(),
            config.reaper.run_hour,
            config.reaper.run_minute,
            config.reaper.notify_admins,
        ));
        tokio::spawn(reaper.run());
        tracing::info!(
            run_hour = config.reaper.run_hour,
            run_minute = config.reaper.run_minute,
            "Daily expiry cleanup scheduled"
        );
    }

    audit.record("DAEMON_STARTED", serde_json::json!({})).await;
    tracing::info!("Background jobs started, daemon is ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}
