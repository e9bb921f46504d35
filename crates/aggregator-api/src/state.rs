//! Shared application state for the aggregator API.
//!
//! [`AppState`] owns the aggregation pipeline and the in-process historian
//! that backs the `/v1/historian` routes. When the pipeline itself uses the
//! in-process historian, both share the same readings.

use aggregator_core::historian::{HistorianClient, LocalHistorian};
use aggregator_core::pipeline::AggregationPipeline;
use aggregator_store::RecordBackendClient;
use chrono::{DateTime, Utc};

/// The pipeline type served over HTTP.
pub type ServicePipeline = AggregationPipeline<HistorianClient, RecordBackendClient>;

/// State shared by every request handler.
#[derive(Debug)]
pub struct AppState {
    /// Reading validation, historian calls, and aggregate storage.
    pub pipeline: ServicePipeline,
    /// Historian served under `/v1/historian`.
    pub local_historian: LocalHistorian,
    /// When this process started serving.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wrap a pipeline. Reuses its historian for the historian routes when
    /// it is the in-process one, otherwise starts a separate one.
    pub fn new(pipeline: ServicePipeline) -> Self {
        let local_historian = pipeline
            .historian()
            .as_local()
            .cloned()
            .unwrap_or_default();
        Self {
            pipeline,
            local_historian,
            started_at: Utc::now(),
        }
    }
}
