use std::error::Error as StdError;

use uuid::Uuid;

/// Boxed error raised from inside a caller-supplied transformer.
pub type TransformError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no current row for {uuid} in {table}")]
    NotFound { table: String, uuid: Uuid },
    #[error("transform contract violation: {0}")]
    ContractViolation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database busy: {0}")]
    Busy(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transform failed: {0}")]
    Transform(#[source] TransformError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::ContractViolation(message.into())
    }

    pub fn not_found(table: impl Into<String>, uuid: Uuid) -> Self {
        Self::NotFound { table: table.into(), uuid }
    }

    /// Whether retrying the same unit of work could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
