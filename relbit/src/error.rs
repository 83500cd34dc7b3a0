use std::sync::PoisonError;
use config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unresolved type: {0}")]
    UnresolvedType(String),

    #[error("Ambiguous relationship {entity}.{relation}: {detail}")]
    AmbiguousRelationship {
        entity: String,
        relation: String,
        detail: String,
    },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl AppError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::Configuration(msg.into())
    }

    pub fn ambiguous(entity: &str, relation: &str, detail: impl Into<String>) -> Self {
        AppError::AmbiguousRelationship {
            entity: entity.to_string(),
            relation: relation.to_string(),
            detail: detail.into(),
        }
    }

    /// Resolution errors are fatal and never worth retrying; persistence failures are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Persistence(_))
    }
}

impl<T> From<PoisonError<T>> for AppError
{
    fn from(e: PoisonError<T>) -> Self {
        AppError::Custom(format!("Poison error: {:?}", e.to_string()))
    }
}

/// Everything the storage layer can reject a read or write with.
#[derive(Debug, Error)]
pub enum PersistenceError {

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Join: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Rejected: {0}")]
    Rejected(String),
}

impl<T> From<PoisonError<T>> for PersistenceError
{
    fn from(e: PoisonError<T>) -> Self {
        PersistenceError::Rejected(format!("Poison error: {:?}", e.to_string()))
    }
}
