//! Storage Error Types
//!
//! All storage operations return `Result<T>` aliased to
//! `Result<T, StoreError>` so errors propagate cleanly with `?`. The
//! partition manager deliberately never surfaces these to callers - it logs
//! and degrades - but the raw store traits do.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid partition name: {0}")]
    InvalidPartitionName(String),

    #[error("Unparseable partition bound: {0}")]
    InvalidPartitionBound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(e.to_string())
    }
}
