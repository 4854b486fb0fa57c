//! Конфигурация xray: чтение и правка документа целиком.
//!
//! Документ редактируется как одно целое; перед каждой записью текущий
//! файл копируется в каталог резервных копий. Все поля, которые ядро не
//! интерпретирует, сохраняются без изменений через flatten-карты.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XrayConfigError {
    #[error("Не удалось прочитать {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Не удалось записать {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("Некорректный JSON в {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("Inbound с тегом \"{0}\" не найден в конфигурации xray")]
    MissingInbound(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XrayDocument {
    #[serde(default)]
    pub inbounds: Vec<Inbound>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<InboundSettings>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<Map<String, Value>>>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

fn client_matches_email(client: &Map<String, Value>, email: &str) -> bool {
    client.get("email").and_then(Value::as_str) == Some(email)
}

pub struct XrayConfigFile {
    path: PathBuf,
    backup_dir: PathBuf,
}

impl XrayConfigFile {
    pub fn new(path: impl AsRef<Path>, backup_dir: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            backup_dir: backup_dir.as_ref().to_path_buf(),
        }
    }

    pub async fn read(&self) -> Result<XrayDocument, XrayConfigError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| XrayConfigError::Read {
                path: self.path.display().to_string(),
                source,
            })?;
        serde_json::from_str(&raw).map_err(|source| XrayConfigError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub async fn write(&self, document: &XrayDocument) -> Result<(), XrayConfigError> {
        self.backup_current().await;

        let raw = serde_json::to_string_pretty(document).map_err(|source| {
            XrayConfigError::Parse {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|source| XrayConfigError::Write {
                path: self.path.display().to_string(),
                source,
            })
    }

    async fn backup_current(&self) {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f");
            let backup_path = self.backup_dir.join(format!("config-{}.json", stamp));
            if let Err(error) = tokio::fs::create_dir_all(&self.backup_dir).await {
                tracing::warn!(
                    dir = %self.backup_dir.display(),
                    error = %error,
                    "Не удалось создать каталог резервных копий"
                );
                return;
            }
            if let Err(error) = tokio::fs::copy(&self.path, &backup_path).await {
                tracing::warn!(
                    backup = %backup_path.display(),
                    error = %error,
                    "Не удалось создать резервную копию конфигурации"
                );
            }
        }
    }

    /// Добавляет клиентскую запись в каждый из указанных inbound-тегов,
    /// предварительно удалив записи с тем же email.
    pub async fn upsert_client(
        &self,
        inbound_tags: &[&str],
        email: &str,
        client: Map<String, Value>,
    ) -> Result<(), XrayConfigError> {
        let mut document = self.read().await?;
        for tag in inbound_tags {
            let inbound = document
                .inbounds
                .iter_mut()
                .find(|inbound| inbound.tag.as_deref() == Some(*tag))
                .ok_or_else(|| XrayConfigError::MissingInbound(tag.to_string()))?;
            let settings = inbound.settings.get_or_insert_with(InboundSettings::default);
            let clients = settings.clients.get_or_insert_with(Vec::new);
            clients.retain(|existing| !client_matches_email(existing, email));
            clients.push(client.clone());
        }
        self.write(&document).await
    }

    /// Удаляет клиентские записи с данным email из всех inbound'ов.
    /// Запись выполняется только если что-то было удалено.
    pub async fn remove_client(&self, email: &str) -> Result<bool, XrayConfigError> {
        let mut document = self.read().await?;
        let mut removed = false;
        for inbound in &mut document.inbounds {
            if let Some(settings) = inbound.settings.as_mut()
                && let Some(clients) = settings.clients.as_mut()
            {
                let before = clients.len();
                clients.retain(|existing| !client_matches_email(existing, email));
                if clients.len() < before {
                    removed = true;
                }
            }
        }
        if removed {
            self.write(&document).await?;
        }
        Ok(removed)
    }
}
