//! Error types for the storage layer.
//!
//! All errors are propagated via [`StoreError`]. Store-level misuse
//! (`NotFound`, `AlreadyExists`, `NoMatchingEntries`) is distinguished from
//! infrastructure failures coming from [`sqlx`].

use aggregator_types::ErrorKind;

/// Errors that can occur in the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An entry or record with this key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// No entry or record exists for this key.
    #[error("not found: {0}")]
    NotFound(String),

    /// An aggregation query matched no entries.
    #[error("no entries match prefix `{0}`")]
    NoMatchingEntries(String),

    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be represented (e.g. a negative version).
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Stable error classification.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NoMatchingEntries(_) => ErrorKind::NoMatchingEntries,
            Self::Postgres(_)
            | Self::Migration(_)
            | Self::Serialization(_)
            | Self::Corrupt(_)
            | Self::Config(_) => ErrorKind::Internal,
        }
    }
}
