//! SQLite-слой учёта: аккаунты, IP-предупреждения и агенты.

use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Протокол, под которым заведён аккаунт.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Trojan,
    Vmess,
}

impl Protocol {
    /// Inbound-теги конфигурации xray, в которые добавляется клиент.
    pub fn inbound_tags(&self) -> &'static [&'static str] {
        match self {
            Protocol::Vless => &["vless-ws", "vless-grpc"],
            Protocol::Trojan => &["trojan-ws", "trojan-grpc"],
            Protocol::Vmess => &["vmess-ws", "vmess-grpc"],
        }
    }

    /// Имя поля секрета в клиентской записи inbound'а.
    pub fn credential_field(&self) -> &'static str {
        match self {
            Protocol::Vless | Protocol::Vmess => "id",
            Protocol::Trojan => "password",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Vmess => "vmess",
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "vmess" => Ok(Protocol::Vmess),
            other => Err(anyhow::anyhow!("Неизвестный протокол: {}", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub username_lower: String,
    pub protocol: Protocol,
    pub credential: String,
    pub expiry: i64,
    pub agent_id: Option<String>,
    pub created_by: String,
    pub created_at: i64,
    pub is_active: bool,
    pub quota_total_bytes: i64,
    pub traffic_used: i64,
    pub last_uplink: i64,
    pub last_downlink: i64,
    pub last_checked_at: Option<i64>,
}

/// Данные для вставки нового аккаунта.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub protocol: Protocol,
    pub credential: String,
    pub expiry: i64,
    pub agent_id: Option<String>,
    pub created_by: String,
    pub quota_total_bytes: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct IpWarning {
    pub id: i64,
    pub username: String,
    pub violation_count: i64,
    pub last_warning_at: Option<i64>,
    pub last_ip_fingerprint: Option<String>,
    pub clean_checks: i64,
    pub first_violation_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Agent {
    pub id: i64,
    pub agent_id: String,
    pub balance: i64,
    pub max_users: i64,
    pub created_at: i64,
}

const ACCOUNT_COLUMNS: &str = "id, username, username_lower, protocol, credential, expiry, \
     agent_id, created_by, created_at, is_active, quota_total_bytes, traffic_used, \
     last_uplink, last_downlink, last_checked_at";

const IP_WARNING_COLUMNS: &str =
    "id, username, violation_count, last_warning_at, last_ip_fingerprint, clean_checks, first_violation_at";

pub fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("Системное время меньше UNIX_EPOCH: {}", err))
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// БД в памяти на одном соединении: каждое соединение sqlite::memory:
    /// видит собственную базу, поэтому пул ограничен единицей.
    pub async fn open_in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось открыть SQLite в памяти: {}", e))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                username_lower TEXT NOT NULL UNIQUE,
                protocol TEXT NOT NULL,
                credential TEXT NOT NULL,
                expiry INTEGER NOT NULL,
                agent_id TEXT,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                quota_total_bytes INTEGER NOT NULL DEFAULT 0,
                traffic_used INTEGER NOT NULL DEFAULT 0,
                last_uplink INTEGER NOT NULL DEFAULT 0,
                last_downlink INTEGER NOT NULL DEFAULT 0,
                last_checked_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_active_quota ON accounts(is_active, quota_total_bytes);
            CREATE INDEX IF NOT EXISTS idx_accounts_agent ON accounts(agent_id);
            CREATE INDEX IF NOT EXISTS idx_accounts_expiry ON accounts(expiry);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция accounts: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ip_warnings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                violation_count INTEGER NOT NULL DEFAULT 0,
                last_warning_at INTEGER,
                last_ip_fingerprint TEXT,
                clean_checks INTEGER NOT NULL DEFAULT 0,
                first_violation_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция ip_warnings: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL UNIQUE,
                balance INTEGER NOT NULL DEFAULT 0,
                max_users INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция agents: {}", e))?;

        self.ensure_column_exists("agents", "max_users", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        self.ensure_column_exists("ip_warnings", "last_ip_fingerprint", "TEXT")
            .await?;

        Ok(())
    }

    async fn ensure_column_exists(
        &self,
        table: &str,
        column: &str,
        sql_type: &str,
    ) -> Result<(), anyhow::Error> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = '{}'",
            table, column
        ))
        .fetch_one(&self.pool)
        .await?;
        if count == 0 {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, sql_type
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // --- Аккаунты ---

    pub async fn insert_account(&self, new: &NewAccount) -> Result<Account, anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "INSERT INTO accounts (username, username_lower, protocol, credential, expiry, \
             agent_id, created_by, created_at, is_active, quota_total_bytes) \
             VALUES (?, lower(?), ?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(&new.username)
        .bind(&new.username)
        .bind(new.protocol)
        .bind(&new.credential)
        .bind(new.expiry)
        .bind(new.agent_id.as_deref())
        .bind(&new.created_by)
        .bind(now)
        .bind(new.quota_total_bytes)
        .execute(&self.pool)
        .await?;

        self.find_account(&new.username)
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что вставленный аккаунт не найден"))
    }

    pub async fn find_account(&self, username: &str) -> Result<Option<Account>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE username_lower = lower(?)",
            ACCOUNT_COLUMNS
        );
        let row = sqlx::query_as::<_, Account>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Поиск с учётом владельца: при заданном agent_id чужой аккаунт
    /// неотличим от отсутствующего.
    pub async fn find_account_scoped(
        &self,
        username: &str,
        agent_id: Option<&str>,
    ) -> Result<Option<Account>, anyhow::Error> {
        match agent_id {
            None => self.find_account(username).await,
            Some(agent_id) => {
                let sql = format!(
                    "SELECT {} FROM accounts WHERE username_lower = lower(?) AND agent_id = ?",
                    ACCOUNT_COLUMNS
                );
                let row = sqlx::query_as::<_, Account>(&sql)
                    .bind(username)
                    .bind(agent_id)
                    .fetch_optional(&self.pool)
                    .await?;
                Ok(row)
            }
        }
    }

    pub async fn delete_account(&self, username: &str) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM accounts WHERE username_lower = lower(?)")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_inactive(&self, username: &str) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("UPDATE accounts SET is_active = 0 WHERE username_lower = lower(?)")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Продление: новый срок, реактивация и (опционально) сброс квоты.
    pub async fn apply_extension(
        &self,
        username: &str,
        new_expiry: i64,
        reset_quota: bool,
    ) -> Result<bool, anyhow::Error> {
        let sql = if reset_quota {
            "UPDATE accounts SET expiry = ?, is_active = 1, traffic_used = 0, \
             last_uplink = 0, last_downlink = 0, last_checked_at = NULL \
             WHERE username_lower = lower(?)"
        } else {
            "UPDATE accounts SET expiry = ?, is_active = 1 WHERE username_lower = lower(?)"
        };
        let result = sqlx::query(sql)
            .bind(new_expiry)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_traffic(
        &self,
        username: &str,
        traffic_used: i64,
        last_uplink: i64,
        last_downlink: i64,
        checked_at: i64,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            "UPDATE accounts SET traffic_used = ?, last_uplink = ?, last_downlink = ?, \
             last_checked_at = ? WHERE username_lower = lower(?)",
        )
        .bind(traffic_used)
        .bind(last_uplink)
        .bind(last_downlink)
        .bind(checked_at)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Ручной сброс накопленного трафика; применяется только к аккаунтам
    /// с ограниченной квотой.
    pub async fn reset_traffic(&self, username: &str) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "UPDATE accounts SET traffic_used = 0, last_uplink = 0, last_downlink = 0, \
             last_checked_at = ? WHERE username_lower = lower(?) AND quota_total_bytes > 0",
        )
        .bind(now)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Смена квоты сбрасывает и накопленное использование.
    pub async fn set_quota(&self, username: &str, total_bytes: i64) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "UPDATE accounts SET quota_total_bytes = ?, traffic_used = 0, last_uplink = 0, \
             last_downlink = 0, last_checked_at = ? WHERE username_lower = lower(?)",
        )
        .bind(total_bytes)
        .bind(now)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_quota_enforced(&self) -> Result<Vec<Account>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE is_active = 1 AND quota_total_bytes > 0 \
             ORDER BY username_lower ASC",
            ACCOUNT_COLUMNS
        );
        let rows = sqlx::query_as::<_, Account>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn list_expired_active(&self, now: i64) -> Result<Vec<Account>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE expiry < ? AND is_active = 1 \
             ORDER BY expiry ASC",
            ACCOUNT_COLUMNS
        );
        let rows = sqlx::query_as::<_, Account>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count_accounts(&self) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn count_by_owner(&self, agent_id: &str) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn count_expired_active(&self, now: i64) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM accounts WHERE expiry < ? AND is_active = 1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    // --- IP-предупреждения ---

    pub async fn get_ip_warning(&self, username: &str) -> Result<Option<IpWarning>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM ip_warnings WHERE username = ?",
            IP_WARNING_COLUMNS
        );
        let row = sqlx::query_as::<_, IpWarning>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn save_ip_warning(
        &self,
        username: &str,
        violation_count: i64,
        last_warning_at: Option<i64>,
        last_ip_fingerprint: Option<&str>,
        clean_checks: i64,
        first_violation_at: i64,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            "INSERT INTO ip_warnings (username, violation_count, last_warning_at, \
             last_ip_fingerprint, clean_checks, first_violation_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(username) DO UPDATE SET \
             violation_count = excluded.violation_count, \
             last_warning_at = excluded.last_warning_at, \
             last_ip_fingerprint = excluded.last_ip_fingerprint, \
             clean_checks = excluded.clean_checks",
        )
        .bind(username)
        .bind(violation_count)
        .bind(last_warning_at)
        .bind(last_ip_fingerprint)
        .bind(clean_checks)
        .bind(first_violation_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_clean_checks(
        &self,
        username: &str,
        clean_checks: i64,
    ) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE ip_warnings SET clean_checks = ? WHERE username = ?")
            .bind(clean_checks)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_ip_warning(&self, username: &str) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM ip_warnings WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- Агенты ---

    pub async fn create_agent(
        &self,
        agent_id: &str,
        balance: i64,
        max_users: i64,
    ) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "INSERT INTO agents (agent_id, balance, max_users, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(agent_id)
        .bind(balance)
        .bind(max_users)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, anyhow::Error> {
        let row = sqlx::query_as::<_, Agent>(
            "SELECT id, agent_id, balance, max_users, created_at FROM agents WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn credit_agent(&self, agent_id: &str, amount: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("UPDATE agents SET balance = balance + ? WHERE agent_id = ?")
            .bind(amount)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Условное списание: проходит только при достаточном балансе.
    pub async fn debit_agent(&self, agent_id: &str, amount: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE agents SET balance = balance - ? WHERE agent_id = ? AND balance >= ?",
        )
        .bind(amount)
        .bind(agent_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
