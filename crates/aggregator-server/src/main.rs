//! Aggregator service binary.
//!
//! Wires together the historian client, the optional shared record
//! backend, the aggregation pipeline, and the HTTP API, then serves until
//! `Ctrl-C`.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `aggregator-config.yaml` (defaults if absent)
//! 2. Initialize structured logging (tracing)
//! 3. Build the historian client (HTTP when a URL is configured, otherwise
//!    in-process)
//! 4. Connect to `PostgreSQL` and run migrations when a database URL is
//!    configured
//! 5. Assemble the pipeline and serve the API

mod error;

use std::path::Path;
use std::sync::Arc;

use aggregator_api::AppState;
use aggregator_core::config::AggregatorConfig;
use aggregator_core::coordinator::ConcurrencyCoordinator;
use aggregator_core::historian::{HistorianClient, HttpHistorian, LocalHistorian};
use aggregator_core::pipeline::AggregationPipeline;
use aggregator_core::retry::ResilientRemoteInvoker;
use aggregator_store::{PostgresPool, RecordBackendClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::ServiceError;

/// Path of the configuration file, relative to the working directory.
const CONFIG_PATH: &str = "aggregator-config.yaml";

/// Application entry point for the aggregator service.
///
/// # Errors
///
/// Returns an error if any initialization step or the server fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config_path = Path::new(CONFIG_PATH);
    let config = AggregatorConfig::load_or_default(config_path).map_err(ServiceError::from)?;

    // 2. Initialize structured logging. RUST_LOG wins over the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .init();

    info!(
        config_found = config_path.exists(),
        host = %config.server.host,
        port = config.server.port,
        max_attempts = config.retry.max_attempts,
        base_delay_ms = config.retry.base_delay_ms,
        "aggregator-server starting"
    );

    // 3. Historian client.
    let historian = build_historian(&config)?;
    info!(historian = historian.name(), "historian client ready");

    // 4. Shared record backend.
    let pool = connect_postgres(&config).await?;
    let coordinator = pool.as_ref().map(|pool| {
        let backend = Arc::new(RecordBackendClient::Postgres(pool.record_backend()));
        ConcurrencyCoordinator::new(backend, config.coordinator.coordinator_config())
    });
    info!(
        record_backend = coordinator
            .as_ref()
            .map_or("none", |c| c.backend().name()),
        policy = ?config.coordinator.resolution_policy(),
        "record backend ready"
    );

    // 5. Pipeline and API.
    let pipeline = AggregationPipeline::new(
        historian,
        ResilientRemoteInvoker::new(config.retry.policy()),
    )
    .with_supported_device_types(config.pipeline.supported_device_types.iter().cloned())
    .with_optional_coordinator(coordinator);

    let state = Arc::new(AppState::new(pipeline));
    aggregator_api::start_server(&config.server, state)
        .await
        .map_err(ServiceError::from)?;

    if let Some(pool) = pool {
        pool.close().await;
    }

    info!("aggregator-server shutdown complete");
    Ok(())
}

/// Pick the historian: HTTP when a URL is configured, in-process otherwise.
fn build_historian(config: &AggregatorConfig) -> Result<HistorianClient, ServiceError> {
    match &config.historian.url {
        Some(url) => {
            let client = HttpHistorian::new(url, config.historian.request_timeout())?;
            info!(url = %client.base_url(), "using remote historian");
            Ok(HistorianClient::Http(client))
        }
        None => {
            info!("no historian URL configured, using in-process historian");
            Ok(HistorianClient::Local(LocalHistorian::new()))
        }
    }
}

/// Connect to `PostgreSQL` and apply migrations when a URL is configured.
async fn connect_postgres(config: &AggregatorConfig) -> Result<Option<PostgresPool>, ServiceError> {
    let Some(url) = &config.infrastructure.postgres_url else {
        info!("no database URL configured, aggregates stay in process memory");
        return Ok(None);
    };

    let pool = PostgresPool::connect(url, &config.infrastructure.pool_settings()).await?;
    pool.run_migrations().await?;
    info!("PostgreSQL connected and migrated");
    Ok(Some(pool))
}
