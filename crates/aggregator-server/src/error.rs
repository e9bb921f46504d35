//! Error types for the aggregator service binary.
//!
//! [`ServiceError`] is the top-level error type that wraps all possible
//! failure modes during startup and serving.

/// Top-level error for the aggregator service binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: aggregator_core::config::ConfigError,
    },

    /// The historian client could not be built.
    #[error("historian error: {source}")]
    Historian {
        /// The underlying historian error.
        #[from]
        source: aggregator_core::historian::HistorianError,
    },

    /// Connecting to or migrating the record database failed.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: aggregator_store::StoreError,
    },

    /// The HTTP server failed to start or stopped with an error.
    #[error("server error: {source}")]
    Server {
        /// The underlying server error.
        #[from]
        source: aggregator_api::ServerError,
    },
}
