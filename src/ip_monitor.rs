//! Контроль одновременных IP-адресов на пользователя.
//!
//! Нарушение фиксируется, когда за скользящее окно по access-логу видно
//! больше адресов, чем разрешено. Повторные предупреждения по
//! неизменному набору адресов внутри часа не плодятся; после серии
//! чистых проверок счётчик снимается целиком.

use crate::access_log::LogTailScanner;
use crate::audit::AuditLog;
use crate::format::format_timestamp;
use crate::lifecycle::{DeleteReason, LifecycleManager};
use crate::notify::{Audience, NotificationSink};
use crate::store::{Store, current_unix_timestamp};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IpPolicy {
    pub max_ip_limit: usize,
    pub warning_threshold: i64,
    pub clean_checks_reset: i64,
    /// Скользящее окно access-лога.
    pub window: Duration,
    /// Пауза, после которой неизменный набор адресов снова считается
    /// новым предупреждением.
    pub warning_cooldown_secs: i64,
}

pub struct IpViolationMonitor {
    store: Arc<Store>,
    scanner: Arc<dyn LogTailScanner>,
    lifecycle: Arc<LifecycleManager>,
    notifier: Arc<dyn NotificationSink>,
    audit: AuditLog,
    policy: IpPolicy,
}

impl IpViolationMonitor {
    pub fn new(
        store: Arc<Store>,
        scanner: Arc<dyn LogTailScanner>,
        lifecycle: Arc<LifecycleManager>,
        notifier: Arc<dyn NotificationSink>,
        audit: AuditLog,
        policy: IpPolicy,
    ) -> Self {
        Self {
            store,
            scanner,
            lifecycle,
            notifier,
            audit,
            policy,
        }
    }

    /// Один проход: каждый пользователь, замеченный в окне, либо двигает
    /// счётчик нарушений, либо набирает чистые проверки. Молчащие
    /// пользователи не двигают ничего.
    pub async fn tick(&self) -> Result<(), anyhow::Error> {
        let online = self.scanner.recent_ips(self.policy.window).await;
        for (username, ips) in &online {
            if let Err(error) = self.process_account(username, ips).await {
                tracing::warn!(
                    username = %username,
                    error = %error,
                    "Сбой обработки IP-нарушения, продолжаю проход"
                );
            }
        }
        Ok(())
    }

    async fn process_account(&self, username: &str, ips: &[String]) -> Result<(), anyhow::Error> {
        if ips.len() > self.policy.max_ip_limit {
            self.process_violation(username, ips).await
        } else {
            self.process_clean_check(username).await
        }
    }

    async fn process_violation(&self, username: &str, ips: &[String]) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        let existing = self.store.get_ip_warning(username).await?;

        let (mut violation_count, last_warning_at, last_fingerprint, first_violation_at) =
            match &existing {
                Some(warning) => (
                    warning.violation_count,
                    warning.last_warning_at,
                    warning.last_ip_fingerprint.clone(),
                    warning.first_violation_at,
                ),
                None => (0, None, None, now),
            };

        let fingerprint = ips.join(",");
        let new_warning = match last_warning_at {
            None => true,
            Some(at) => {
                now - at > self.policy.warning_cooldown_secs
                    || last_fingerprint.as_deref() != Some(fingerprint.as_str())
            }
        };

        let mut last_warning_at = last_warning_at;
        let mut stored_fingerprint = last_fingerprint;
        if new_warning {
            violation_count += 1;
            last_warning_at = Some(now);
            stored_fingerprint = Some(fingerprint.clone());
        }

        if violation_count >= self.policy.warning_threshold {
            let message = format!(
                "🚫 Повторное превышение лимита IP\n\n\
                 👤 Пользователь: {}\n\
                 🌐 Обнаружено {} IP: {}\n\
                 ⚠️ Пользователь удалён автоматически после {} предупреждений.\n\
                 ⏰ Время: {}",
                username,
                ips.len(),
                ips.join(", "),
                violation_count,
                format_timestamp(now)
            );
            self.lifecycle
                .delete(username, "system", DeleteReason::MultiIpViolation, None)
                .await?;
            self.store.delete_ip_warning(username).await?;
            self.notifier.notify(Audience::Admins, &message).await;
        } else {
            // Любой нарушающий проход обнуляет серию чистых проверок,
            // даже когда само предупреждение дедуплицировано.
            self.store
                .save_ip_warning(
                    username,
                    violation_count,
                    last_warning_at,
                    stored_fingerprint.as_deref(),
                    0,
                    first_violation_at,
                )
                .await?;
            if new_warning {
                let message = format!(
                    "⚠️ Превышение лимита IP\n\n\
                     👤 Пользователь: {}\n\
                     🌐 Обнаружено {} IP: {}\n\
                     ⚡ Лимит: {} IP.\n\
                     🚨 Предупреждение {} из {}.\n\
                     ⏰ Время: {}",
                    username,
                    ips.len(),
                    ips.join(", "),
                    self.policy.max_ip_limit,
                    violation_count,
                    self.policy.warning_threshold,
                    format_timestamp(now)
                );
                self.notifier.notify(Audience::Admins, &message).await;
            }
        }

        if new_warning {
            self.audit
                .record(
                    "MULTI_IP_VIOLATION_DETECTED",
                    json!({
                        "username": username,
                        "ip_count": ips.len(),
                        "warning_count": violation_count,
                        "ips": ips,
                    }),
                )
                .await;
        }
        Ok(())
    }

    async fn process_clean_check(&self, username: &str) -> Result<(), anyhow::Error> {
        let Some(warning) = self.store.get_ip_warning(username).await? else {
            return Ok(());
        };
        if warning.violation_count <= 0 {
            return Ok(());
        }

        let clean_checks = warning.clean_checks + 1;
        if clean_checks >= self.policy.clean_checks_reset {
            let message = format!(
                "✅ Сброс предупреждений\n\n\
                 👤 Пользователь: {}\n\
                 ℹ️ Предупреждения сняты после {} чистых проверок.",
                username, clean_checks
            );
            self.store.delete_ip_warning(username).await?;
            self.notifier.notify(Audience::Admins, &message).await;
            self.audit
                .record("MULTI_IP_WARNING_RESET", json!({ "username": username }))
                .await;
        } else {
            self.store.set_clean_checks(username, clean_checks).await?;
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            if let Err(error) = self.tick().await {
                tracing::error!(error = %error, "Проход IP-мониторинга завершился ошибкой");
            }
        }
    }
}
