//! Error taxonomy shared by the resolver, the adapters and the projector.
//!
//! `NotFoundOrDenied` deliberately carries no payload: callers must not be
//! able to tell a missing resource from one they are not allowed to see.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("not found or access denied")]
    NotFoundOrDenied,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("temporarily unavailable: {0}")]
    Transient(String),
    #[error("corrupt payload: {0}")]
    Corrupt(String),
}

pub type AccessResult<T> = Result<T, AccessError>;

impl AccessError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed(reason.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    /// Only `Transient` failures may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Short machine-readable code, used as a structured log field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFoundOrDenied => "not_found_or_denied",
            Self::Forbidden(_) => "forbidden",
            Self::ValidationFailed(_) => "validation_failed",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Corrupt(_) => "corrupt",
        }
    }
}

impl From<redis::RedisError> for AccessError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transient(format!("redis: {err}"))
    }
}

impl From<reqwest::Error> for AccessError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(format!("identity provider unreachable: {err}"))
    }
}

impl From<serde_json::Error> for AccessError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<sqlx::Error> for AccessError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFoundOrDenied,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            other => Self::Transient(format!("database: {other}")),
        }
    }
}
