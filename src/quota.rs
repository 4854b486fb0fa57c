//! Сверка накопленного трафика с квотами.
//!
//! Внешние счётчики xray не монотонны: рестарт демона обнуляет их.
//! Падение сырого значения ниже последнего наблюдения трактуется как
//! сброс, и дельтой становится само сырое значение. Так накопленный
//! расход переживает рестарты без двойного счёта и без потерь.

use crate::audit::AuditLog;
use crate::format::{format_bytes, format_timestamp};
use crate::lifecycle::{DeleteReason, LifecycleManager};
use crate::notify::{Audience, NotificationSink};
use crate::stats::TrafficCounterReader;
use crate::store::{Account, Store, current_unix_timestamp};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub struct QuotaReconciler {
    store: Arc<Store>,
    reader: Arc<dyn TrafficCounterReader>,
    lifecycle: Arc<LifecycleManager>,
    notifier: Arc<dyn NotificationSink>,
    audit: AuditLog,
    /// Пауза между пользователями: не душить stats-API частыми запросами.
    per_account_delay: Duration,
    notify_on_exceed: bool,
}

fn delta_with_reset_detection(raw: i64, last_observed: i64) -> i64 {
    if raw < last_observed { raw } else { raw - last_observed }
}

impl QuotaReconciler {
    pub fn new(
        store: Arc<Store>,
        reader: Arc<dyn TrafficCounterReader>,
        lifecycle: Arc<LifecycleManager>,
        notifier: Arc<dyn NotificationSink>,
        audit: AuditLog,
        per_account_delay: Duration,
        notify_on_exceed: bool,
    ) -> Self {
        Self {
            store,
            reader,
            lifecycle,
            notifier,
            audit,
            per_account_delay,
            notify_on_exceed,
        }
    }

    /// Один проход по всем активным аккаунтам с ограниченной квотой.
    /// Сбой на одном аккаунте не прерывает остальных.
    pub async fn tick(&self) -> Result<(), anyhow::Error> {
        self.audit.record("QUOTA_CHECK_JOB_STARTED", json!({})).await;
        let accounts = self.store.list_quota_enforced().await?;
        for account in &accounts {
            if let Err(error) = self.reconcile_account(account).await {
                tracing::warn!(
                    username = %account.username,
                    error = %error,
                    "Сбой сверки квоты, продолжаю проход"
                );
            }
            if !self.per_account_delay.is_zero() {
                tokio::time::sleep(self.per_account_delay).await;
            }
        }
        self.audit
            .record(
                "QUOTA_CHECK_JOB_FINISHED",
                json!({ "users_checked": accounts.len() }),
            )
            .await;
        Ok(())
    }

    async fn reconcile_account(&self, account: &Account) -> Result<(), anyhow::Error> {
        let snapshot = self.reader.read(&account.username).await;

        let delta_uplink = delta_with_reset_detection(snapshot.uplink_bytes, account.last_uplink);
        let delta_downlink =
            delta_with_reset_detection(snapshot.downlink_bytes, account.last_downlink);
        let new_traffic_used = account.traffic_used + delta_uplink + delta_downlink;

        let now = current_unix_timestamp()?;
        self.store
            .update_traffic(
                &account.username,
                new_traffic_used,
                snapshot.uplink_bytes,
                snapshot.downlink_bytes,
                now,
            )
            .await?;

        tracing::debug!(
            username = %account.username,
            raw_uplink = snapshot.uplink_bytes,
            raw_downlink = snapshot.downlink_bytes,
            delta_uplink = delta_uplink,
            delta_downlink = delta_downlink,
            traffic_used = new_traffic_used,
            quota = account.quota_total_bytes,
            "Трафик пользователя обновлён"
        );

        if new_traffic_used >= account.quota_total_bytes {
            self.audit
                .record(
                    "USER_QUOTA_EXCEEDED",
                    json!({
                        "username": account.username,
                        "traffic_used": new_traffic_used,
                        "quota": account.quota_total_bytes,
                    }),
                )
                .await;

            self.lifecycle
                .delete(&account.username, "system", DeleteReason::QuotaExceeded, None)
                .await?;

            if self.notify_on_exceed {
                let message = format!(
                    "🚫 Квота исчерпана\n\n\
                     👤 Пользователь: {}\n\
                     📊 Использовано: {}\n\
                     ⚖️ Лимит: {}\n\
                     ⚠️ Пользователь удалён автоматически.\n\
                     ⏰ Время: {}",
                    account.username,
                    format_bytes(new_traffic_used),
                    format_bytes(account.quota_total_bytes),
                    format_timestamp(now)
                );
                self.notifier.notify(Audience::Admins, &message).await;
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            if let Err(error) = self.tick().await {
                tracing::error!(error = %error, "Проход проверки квот завершился ошибкой");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::{Harness, harness};
    use crate::notify::test_support::RecordingSink;
    use crate::stats::TrafficSnapshot;
    use crate::store::Protocol;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct QueuedReader {
        snapshots: Mutex<VecDeque<TrafficSnapshot>>,
        calls: AtomicU32,
    }

    impl QueuedReader {
        fn new(snapshots: Vec<(i64, i64)>) -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(
                    snapshots
                        .into_iter()
                        .map(|(uplink_bytes, downlink_bytes)| TrafficSnapshot {
                            uplink_bytes,
                            downlink_bytes,
                        })
                        .collect(),
                ),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TrafficCounterReader for QueuedReader {
        async fn read(&self, _username: &str) -> TrafficSnapshot {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.snapshots
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default()
        }
    }

    fn reconciler(
        h: &Harness,
        reader: Arc<QueuedReader>,
        sink: Arc<RecordingSink>,
    ) -> QuotaReconciler {
        QuotaReconciler::new(
            h.store.clone(),
            reader,
            h.lifecycle.clone(),
            sink,
            AuditLog::new(std::env::temp_dir().join(format!(
                "xray-admin-quota-audit-{}.log",
                std::process::id()
            ))),
            Duration::ZERO,
            true,
        )
    }

    #[test]
    fn delta_rule_treats_decrease_as_counter_reset() {
        assert_eq!(delta_with_reset_detection(300, 100), 200);
        assert_eq!(delta_with_reset_detection(50, 300), 50);
        assert_eq!(delta_with_reset_detection(0, 0), 0);
        assert_eq!(delta_with_reset_detection(100, 100), 0);
    }

    #[tokio::test]
    async fn accumulation_survives_counter_resets() {
        let h = harness().await;
        h.lifecycle
            .create(Protocol::Vless, "alice", 30, None, 10_000_000)
            .await
            .unwrap();

        // Третье чтение ниже второго: демон был перезапущен.
        let reader = QueuedReader::new(vec![(100, 50), (300, 80), (50, 10), (200, 60)]);
        let sink = RecordingSink::new();
        let reconciler = reconciler(&h, reader, sink);

        for expected in [150, 380, 440, 640] {
            reconciler.tick().await.unwrap();
            let account = h.store.find_account("alice").await.unwrap().unwrap();
            assert_eq!(account.traffic_used, expected);
            assert!(account.last_checked_at.is_some());
        }

        let account = h.store.find_account("alice").await.unwrap().unwrap();
        assert_eq!(account.traffic_used, 640);
        assert_eq!(account.last_uplink, 200);
        assert_eq!(account.last_downlink, 60);
    }

    #[tokio::test]
    async fn account_is_deleted_in_the_tick_that_crosses_the_quota() {
        let h = harness().await;
        h.lifecycle
            .create(Protocol::Vless, "bob", 30, None, 1_000_000)
            .await
            .unwrap();
        h.store
            .update_traffic("bob", 999_999, 999_999, 0, 1)
            .await
            .unwrap();

        let reader = QueuedReader::new(vec![(1_000_300, 200)]);
        let sink = RecordingSink::new();
        let reconciler = reconciler(&h, reader, sink.clone());
        reconciler.tick().await.unwrap();

        assert!(h.store.find_account("bob").await.unwrap().is_none());
        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("bob"));
        assert!(messages[0].1.contains("Квота"));
    }

    #[tokio::test]
    async fn exact_boundary_counts_as_exceeded() {
        let h = harness().await;
        h.lifecycle
            .create(Protocol::Vless, "carol", 30, None, 1_000)
            .await
            .unwrap();

        let reader = QueuedReader::new(vec![(600, 400)]);
        let sink = RecordingSink::new();
        let reconciler = reconciler(&h, reader, sink);
        reconciler.tick().await.unwrap();

        assert!(h.store.find_account("carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unlimited_and_inactive_accounts_are_not_polled() {
        let h = harness().await;
        h.lifecycle
            .create(Protocol::Vless, "unlimited", 30, None, 0)
            .await
            .unwrap();
        h.lifecycle
            .create(Protocol::Vless, "paused", 30, None, 1_000)
            .await
            .unwrap();
        h.store.mark_inactive("paused").await.unwrap();

        let reader = QueuedReader::new(vec![]);
        let sink = RecordingSink::new();
        let reconciler = reconciler(&h, reader.clone(), sink);
        reconciler.tick().await.unwrap();

        assert_eq!(reader.calls.load(Ordering::Relaxed), 0);
        assert!(h.store.find_account("unlimited").await.unwrap().is_some());
        assert!(h.store.find_account("paused").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn below_quota_account_survives_with_updated_counters() {
        let h = harness().await;
        h.lifecycle
            .create(Protocol::Vless, "dave", 30, None, 1_000_000)
            .await
            .unwrap();

        let reader = QueuedReader::new(vec![(100_000, 50_000)]);
        let sink = RecordingSink::new();
        let reconciler = reconciler(&h, reader, sink.clone());
        reconciler.tick().await.unwrap();

        let account = h.store.find_account("dave").await.unwrap().unwrap();
        assert_eq!(account.traffic_used, 150_000);
        assert_eq!(account.last_uplink, 100_000);
        assert_eq!(account.last_downlink, 50_000);
        assert!(sink.messages().is_empty());
    }
}
