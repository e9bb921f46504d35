//! `PostgreSQL` pool for the shared versioned-record table.
//!
//! Every aggregator process pointed at the same database commits through
//! one `versioned_records` table, so the pool is the only thing the
//! processes share. Pool sizing comes from [`PoolSettings`]; the service
//! binary fills it from the `infrastructure` config section.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::StoreError;
use crate::pg_backend::PgRecordBackend;

/// Sizing and timeouts of the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// How long a commit may wait for a free connection.
    pub acquire_timeout: Duration,
    /// Idle connections are closed after this long.
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Open pool to the database holding the shared records.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPool")
            .field("size", &self.pool.size())
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl PostgresPool {
    /// Connect to the database at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if `url` is not a valid connection
    /// string, or [`StoreError::Postgres`] if no connection can be opened.
    pub async fn connect(url: &str, settings: &PoolSettings) -> Result<Self, StoreError> {
        let options: PgConnectOptions = url
            .parse()
            .map_err(|e: sqlx::Error| StoreError::Config(format!("invalid database URL: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(settings.idle_timeout)
            .connect_with(options)
            .await?;

        tracing::info!(
            max_connections = settings.max_connections,
            acquire_timeout_ms = settings.acquire_timeout.as_millis(),
            "record database pool open"
        );
        Ok(Self { pool })
    }

    /// Create or upgrade the `versioned_records` table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] if a migration fails.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("record table migrations applied");
        Ok(())
    }

    /// Versioned-record backend sharing this pool.
    pub fn record_backend(&self) -> PgRecordBackend {
        PgRecordBackend::new(self.pool.clone())
    }

    /// Wait for in-flight commits, then close every connection.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("record database pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_url_is_a_config_error() {
        let settings = PoolSettings::default();
        let result = PostgresPool::connect("not a connection string", &settings).await;
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
