//! Ежедневная зачистка просроченных пользователей.

use crate::audit::AuditLog;
use crate::format::format_timestamp;
use crate::lifecycle::{DeleteReason, LifecycleManager};
use crate::notify::{Audience, NotificationSink};
use crate::store::{Account, Store, current_unix_timestamp};
use chrono::Timelike;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReapedAccount {
    pub username: String,
    pub agent_id: Option<String>,
}

pub struct ExpiryReaper {
    store: Arc<Store>,
    lifecycle: Arc<LifecycleManager>,
    notifier: Arc<dyn NotificationSink>,
    audit: AuditLog,
    run_hour: u32,
    run_minute: u32,
    notify_admins: bool,
}

impl ExpiryReaper {
    pub fn new(
        store: Arc<Store>,
        lifecycle: Arc<LifecycleManager>,
        notifier: Arc<dyn NotificationSink>,
        audit: AuditLog,
        run_hour: u32,
        run_minute: u32,
        notify_admins: bool,
    ) -> Self {
        Self {
            store,
            lifecycle,
            notifier,
            audit,
            run_hour,
            run_minute,
            notify_admins,
        }
    }

    /// Находит аккаунты с истёкшим сроком и удаляет их по одному.
    /// Сбой на отдельном аккаунте логируется и не прерывает проход.
    pub async fn sweep(&self, actor: &str) -> Result<Vec<ReapedAccount>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let expired = self.store.list_expired_active(now).await?;
        let mut reaped = Vec::new();

        for account in expired {
            match self.reap_one(&account, actor).await {
                Ok(true) => reaped.push(ReapedAccount {
                    username: account.username.clone(),
                    agent_id: account.agent_id.clone(),
                }),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        username = %account.username,
                        error = %error,
                        "Сбой удаления просроченного пользователя"
                    );
                    self.audit
                        .record(
                            "CLEANUP_SINGLE_USER_ERROR",
                            json!({ "username": account.username, "error": error.to_string() }),
                        )
                        .await;
                }
            }
        }

        if !reaped.is_empty() {
            self.audit
                .record(
                    "EXPIRED_USERS_CLEANED",
                    json!({
                        "count": reaped.len(),
                        "cleaned_by": actor,
                        "users": reaped.iter().map(|r| r.username.clone()).collect::<Vec<_>>(),
                    }),
                )
                .await;
        }
        Ok(reaped)
    }

    async fn reap_one(&self, account: &Account, actor: &str) -> Result<bool, anyhow::Error> {
        // Флаг снимается до удаления: прерванный посередине проход не
        // будет обрабатывать тот же аккаунт повторно.
        self.store.mark_inactive(&account.username).await?;
        let outcome = self
            .lifecycle
            .delete(&account.username, actor, DeleteReason::ExpiredCleanup, None)
            .await?;
        Ok(outcome.success)
    }

    fn build_report(&self, reaped: &[ReapedAccount], now: i64) -> String {
        let mut report = if reaped.is_empty() {
            "ℹ️ Очистка просроченных: удалять нечего.\n".to_string()
        } else {
            let mut lines = format!(
                "🧹 Очистка просроченных пользователей\n\nУдалено {}:\n",
                reaped.len()
            );
            for account in reaped {
                lines.push_str(&format!(
                    "- {} (агент: {})\n",
                    account.username,
                    account.agent_id.as_deref().unwrap_or("—")
                ));
            }
            lines
        };
        report.push_str(&format!("⏰ Время: {}", format_timestamp(now)));
        report
    }

    /// Раз в минуту сверяется с расписанием; в назначенную минуту
    /// локального времени выполняет проход и рассылает отчёт.
    pub async fn run(self: Arc<Self>) {
        let mut timer = tokio::time::interval(Duration::from_secs(60));
        // Первый тик срабатывает немедленно и не должен считаться
        // совпадением с расписанием.
        timer.tick().await;
        loop {
            timer.tick().await;
            let now = chrono::Local::now();
            if now.hour() != self.run_hour || now.minute() != self.run_minute {
                continue;
            }

            self.audit.record("AUTO_CLEANUP_EXPIRED_STARTED", json!({})).await;
            match self.sweep("system_daily_cleanup").await {
                Ok(reaped) => {
                    tracing::info!(count = reaped.len(), "Ежедневная зачистка завершена");
                    if self.notify_admins {
                        let now = current_unix_timestamp().unwrap_or_default();
                        let report = self.build_report(&reaped, now);
                        self.notifier.notify(Audience::Admins, &report).await;
                    }
                }
                Err(error) => {
                    tracing::error!(error = %error, "Ежедневная зачистка завершилась ошибкой");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::{Harness, harness};
    use crate::notify::test_support::RecordingSink;
    use crate::store::{NewAccount, Protocol};

    fn reaper(h: &Harness, sink: Arc<RecordingSink>) -> ExpiryReaper {
        ExpiryReaper::new(
            h.store.clone(),
            h.lifecycle.clone(),
            sink,
            AuditLog::new(std::env::temp_dir().join(format!(
                "xray-admin-reaper-audit-{}.log",
                std::process::id()
            ))),
            3,
            0,
            true,
        )
    }

    async fn insert_with_expiry(h: &Harness, username: &str, expiry: i64, agent: Option<&str>) {
        h.store
            .insert_account(&NewAccount {
                username: username.to_string(),
                protocol: Protocol::Vless,
                credential: uuid::Uuid::new_v4().to_string(),
                expiry,
                agent_id: agent.map(str::to_string),
                created_by: "admin".to_string(),
                quota_total_bytes: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired_active_accounts() {
        let h = harness().await;
        let now = current_unix_timestamp().unwrap();

        insert_with_expiry(&h, "expired1", now - 3600, Some("agent-1")).await;
        insert_with_expiry(&h, "expired2", now - 10, None).await;
        insert_with_expiry(&h, "fresh", now + 3600, None).await;
        insert_with_expiry(&h, "already_off", now - 3600, None).await;
        h.store.mark_inactive("already_off").await.unwrap();

        let sink = RecordingSink::new();
        let reaper = reaper(&h, sink);
        let reaped = reaper.sweep("system_daily_cleanup").await.unwrap();

        let mut usernames: Vec<&str> = reaped.iter().map(|r| r.username.as_str()).collect();
        usernames.sort();
        assert_eq!(usernames, vec!["expired1", "expired2"]);
        assert_eq!(
            reaped
                .iter()
                .find(|r| r.username == "expired1")
                .unwrap()
                .agent_id
                .as_deref(),
            Some("agent-1")
        );

        assert!(h.store.find_account("expired1").await.unwrap().is_none());
        assert!(h.store.find_account("expired2").await.unwrap().is_none());
        assert!(h.store.find_account("fresh").await.unwrap().is_some());
        // Уже выключенный аккаунт проход не трогает.
        assert!(h.store.find_account("already_off").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_with_nothing_to_do_returns_empty() {
        let h = harness().await;
        let now = current_unix_timestamp().unwrap();
        insert_with_expiry(&h, "fresh", now + 3600, None).await;

        let sink = RecordingSink::new();
        let reaper = reaper(&h, sink);
        let reaped = reaper.sweep("system_daily_cleanup").await.unwrap();
        assert!(reaped.is_empty());
    }

    #[tokio::test]
    async fn report_lists_usernames_and_owners() {
        let h = harness().await;
        let sink = RecordingSink::new();
        let reaper = reaper(&h, sink);

        let now = current_unix_timestamp().unwrap();
        let empty = reaper.build_report(&[], now);
        assert!(empty.contains("удалять нечего"));

        let report = reaper.build_report(
            &[
                ReapedAccount {
                    username: "alice".to_string(),
                    agent_id: Some("agent-1".to_string()),
                },
                ReapedAccount {
                    username: "bob".to_string(),
                    agent_id: None,
                },
            ],
            now,
        );
        assert!(report.contains("Удалено 2"));
        assert!(report.contains("alice (агент: agent-1)"));
        assert!(report.contains("bob (агент: —)"));
        assert!(report.contains("⏰ Время:"));
    }
}
