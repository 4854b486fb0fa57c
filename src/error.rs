//! Типизированные ошибки операций жизненного цикла пользователей.

use thiserror::Error;

/// Ошибка операции create/extend/delete.
///
/// Вызывающая сторона различает варианты по виду, а не по тексту:
/// владельческое несоответствие намеренно неотличимо от `NotFound`.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Некорректный ввод: {0}")]
    Validation(String),
    #[error("Username \"{0}\" уже занят")]
    Duplicate(String),
    #[error("Пользователь не найден")]
    NotFound,
    #[error("Достигнут лимит: {0}")]
    Capacity(String),
    #[error("Конфигурация xray: {0}")]
    Config(String),
    #[error("Внешний сервис: {0}")]
    ExternalService(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Короткий тег варианта для аудита и журналирования.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Validation(_) => "validation",
            LifecycleError::Duplicate(_) => "duplicate",
            LifecycleError::NotFound => "not_found",
            LifecycleError::Capacity(_) => "capacity",
            LifecycleError::Config(_) => "config",
            LifecycleError::ExternalService(_) => "external_service",
            LifecycleError::Internal(_) => "internal",
        }
    }
}
