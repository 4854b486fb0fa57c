//! Жизненный цикл аккаунтов: единственная точка создания, продления
//! и удаления. Держит учётную БД и конфигурацию xray согласованными.

use crate::audit::AuditLog;
use crate::error::LifecycleError;
use crate::service::ServiceReload;
use crate::store::{Account, NewAccount, Protocol, Store, current_unix_timestamp};
use crate::xray_cfg::{XrayConfigError, XrayConfigFile};
use rand::distr::{Alphanumeric, SampleString};
use serde_json::{Map, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SECONDS_PER_DAY: i64 = 86_400;

/// Причина удаления; попадает в аудит, на поведение не влияет.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    ExpiredCleanup,
    QuotaExceeded,
    MultiIpViolation,
    AdminManual,
}

impl DeleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteReason::ExpiredCleanup => "expired_cleanup",
            DeleteReason::QuotaExceeded => "quota_exceeded",
            DeleteReason::MultiIpViolation => "multi_ip_violation",
            DeleteReason::AdminManual => "admin_manual_delete",
        }
    }
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug)]
pub struct ExtensionOutcome {
    pub new_expiry: i64,
    pub quota_was_reset: bool,
}

pub struct LifecycleManager {
    store: Arc<Store>,
    xray: Arc<XrayConfigFile>,
    service: Arc<dyn ServiceReload>,
    audit: AuditLog,
    max_users: i64,
    quota_enabled: bool,
    /// Замки по username: одновременные операции над одним именем
    /// сериализуются. Записи не вычищаются — количество имён ограничено
    /// лимитом пользователей.
    username_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn normalize_username(raw: &str) -> Result<String, LifecycleError> {
    let username = raw.trim().to_lowercase();
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    if username.len() < 3 || username.len() > 32 || !valid_chars {
        return Err(LifecycleError::Validation(
            "username: 3-32 символа, строчные буквы, цифры, точка, подчёркивание, дефис".to_string(),
        ));
    }
    Ok(username)
}

fn generate_credential(protocol: Protocol) -> String {
    match protocol {
        Protocol::Vless | Protocol::Vmess => uuid::Uuid::new_v4().to_string(),
        Protocol::Trojan => Alphanumeric.sample_string(&mut rand::rng(), 12),
    }
}

fn map_config_error(error: XrayConfigError) -> LifecycleError {
    match error {
        XrayConfigError::MissingInbound(tag) => {
            LifecycleError::Config(format!("inbound \"{}\" отсутствует", tag))
        }
        other => LifecycleError::ExternalService(other.to_string()),
    }
}

impl LifecycleManager {
    pub fn new(
        store: Arc<Store>,
        xray: Arc<XrayConfigFile>,
        service: Arc<dyn ServiceReload>,
        audit: AuditLog,
        max_users: i64,
        quota_enabled: bool,
    ) -> Self {
        Self {
            store,
            xray,
            service,
            audit,
            max_users,
            quota_enabled,
            username_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_username(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.username_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Создаёт аккаунт: валидация, проверки лимитов, клиентские записи
    /// во всех inbound'ах протокола, перезапуск сервиса, строка в БД.
    ///
    /// Сбой перезапуска не откатывает уже записанную конфигурацию: строка
    /// сохраняется, а вызывающему возвращается `ExternalService`.
    pub async fn create(
        &self,
        protocol: Protocol,
        username: &str,
        duration_days: i64,
        acting_agent_id: Option<&str>,
        quota_bytes: i64,
    ) -> Result<Account, LifecycleError> {
        let username = normalize_username(username)?;
        if duration_days < 1 {
            return Err(LifecycleError::Validation(
                "срок действия должен быть не меньше 1 дня".to_string(),
            ));
        }
        if quota_bytes < 0 {
            return Err(LifecycleError::Validation(
                "квота не может быть отрицательной".to_string(),
            ));
        }

        let _guard = self.lock_username(&username).await;

        if self.store.find_account(&username).await?.is_some() {
            return Err(LifecycleError::Duplicate(username));
        }

        let total = self.store.count_accounts().await?;
        if total >= self.max_users {
            return Err(LifecycleError::Capacity(format!(
                "глобальный лимит пользователей ({})",
                self.max_users
            )));
        }

        if let Some(agent_id) = acting_agent_id {
            let agent = self
                .store
                .get_agent(agent_id)
                .await?
                .ok_or_else(|| {
                    LifecycleError::Validation(format!("агент {} не зарегистрирован", agent_id))
                })?;
            if agent.max_users > 0 {
                let owned = self.store.count_by_owner(agent_id).await?;
                if owned >= agent.max_users {
                    return Err(LifecycleError::Capacity(format!(
                        "лимит агента ({})",
                        agent.max_users
                    )));
                }
            }
        }

        let credential = generate_credential(protocol);
        let now = current_unix_timestamp()?;
        let expiry = now + duration_days * SECONDS_PER_DAY;

        let mut client = Map::new();
        client.insert("email".to_string(), json!(username));
        client.insert(protocol.credential_field().to_string(), json!(credential));
        self.xray
            .upsert_client(protocol.inbound_tags(), &username, client)
            .await
            .map_err(map_config_error)?;

        let reload = self.service.reload().await;
        if !reload.success {
            tracing::warn!(
                username = %username,
                stderr = %reload.stderr,
                "Не удалось перезапустить xray после добавления пользователя"
            );
        }

        let account = self
            .store
            .insert_account(&NewAccount {
                username: username.clone(),
                protocol,
                credential,
                expiry,
                agent_id: acting_agent_id.map(str::to_string),
                created_by: acting_agent_id.unwrap_or("admin").to_string(),
                quota_total_bytes: quota_bytes,
            })
            .await?;

        self.audit
            .record(
                "USER_ADDED_TO_SYSTEM",
                json!({
                    "username": account.username,
                    "protocol": protocol.as_str(),
                    "days": duration_days,
                    "agent_id": account.agent_id,
                    "quota_bytes": quota_bytes,
                }),
            )
            .await;

        if !reload.success {
            return Err(LifecycleError::ExternalService(format!(
                "xray не перезапущен: {}",
                reload.stderr
            )));
        }
        Ok(account)
    }

    /// Продление срока. Отсчёт идёт от прежнего expiry, не от текущего
    /// момента; при включённой квоте накопленный трафик и сырые счётчики
    /// сбрасываются — продление открывает новый расчётный период.
    pub async fn extend(
        &self,
        username: &str,
        additional_days: i64,
        actor: &str,
        scoped_agent_id: Option<&str>,
    ) -> Result<ExtensionOutcome, LifecycleError> {
        if additional_days < 1 {
            return Err(LifecycleError::Validation(
                "срок продления должен быть не меньше 1 дня".to_string(),
            ));
        }
        let key = username.trim().to_lowercase();
        let _guard = self.lock_username(&key).await;

        let account = self
            .store
            .find_account_scoped(username, scoped_agent_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        let new_expiry = account.expiry + additional_days * SECONDS_PER_DAY;
        let quota_was_reset = self.quota_enabled;
        self.store
            .apply_extension(&account.username, new_expiry, quota_was_reset)
            .await?;

        self.audit
            .record(
                "USER_EXTENDED_IN_SYSTEM",
                json!({
                    "username": account.username,
                    "days_added": additional_days,
                    "new_expiry": new_expiry,
                    "extended_by": actor,
                    "quota_reset": quota_was_reset,
                }),
            )
            .await;

        Ok(ExtensionOutcome {
            new_expiry,
            quota_was_reset,
        })
    }

    /// Удаление: клиентские записи вычищаются из всех inbound'ов, не
    /// только из тегов протокола аккаунта. Повторный вызов по
    /// отсутствующему имени возвращает `success: false`, не ошибку.
    pub async fn delete(
        &self,
        username: &str,
        actor: &str,
        reason: DeleteReason,
        scoped_agent_id: Option<&str>,
    ) -> Result<DeleteOutcome, LifecycleError> {
        let key = username.trim().to_lowercase();
        let _guard = self.lock_username(&key).await;

        let account = match self
            .store
            .find_account_scoped(username, scoped_agent_id)
            .await?
        {
            Some(account) => account,
            None => {
                return Ok(DeleteOutcome {
                    success: false,
                    message: format!("Пользователь \"{}\" не найден", username.trim()),
                });
            }
        };

        let removed_from_xray = self
            .xray
            .remove_client(&account.username)
            .await
            .map_err(map_config_error)?;
        if removed_from_xray {
            let reload = self.service.reload().await;
            if !reload.success {
                tracing::warn!(
                    username = %account.username,
                    stderr = %reload.stderr,
                    "Не удалось перезапустить xray после удаления пользователя"
                );
            }
        }

        self.store.delete_account(&account.username).await?;
        self.store.delete_ip_warning(&account.username).await?;

        self.audit
            .record(
                "USER_DELETED_FROM_SYSTEM",
                json!({
                    "username": account.username,
                    "deleted_by": actor,
                    "reason": reason.as_str(),
                    "removed_from_xray": removed_from_xray,
                }),
            )
            .await;

        Ok(DeleteOutcome {
            success: true,
            message: format!("Пользователь \"{}\" удалён", account.username),
        })
    }

    /// Ручной сброс накопленного трафика квотированного аккаунта.
    pub async fn reset_traffic(
        &self,
        username: &str,
        actor: &str,
    ) -> Result<bool, LifecycleError> {
        let key = username.trim().to_lowercase();
        let _guard = self.lock_username(&key).await;

        let reset = self.store.reset_traffic(username).await?;
        if reset {
            self.audit
                .record(
                    "USER_TRAFFIC_RESET_MANUAL",
                    json!({ "username": key, "admin_id": actor }),
                )
                .await;
        }
        Ok(reset)
    }

    /// Смена байтового лимита; использование при этом обнуляется.
    pub async fn set_quota(
        &self,
        username: &str,
        total_bytes: i64,
        actor: &str,
    ) -> Result<bool, LifecycleError> {
        if total_bytes < 0 {
            return Err(LifecycleError::Validation(
                "квота не может быть отрицательной".to_string(),
            ));
        }
        let key = username.trim().to_lowercase();
        let _guard = self.lock_username(&key).await;

        let updated = self.store.set_quota(username, total_bytes).await?;
        if updated {
            self.audit
                .record(
                    "USER_TOTAL_QUOTA_SET",
                    json!({ "username": key, "total_bytes": total_bytes, "admin_id": actor }),
                )
                .await;
        }
        Ok(updated)
    }
}
