//! Historian clients: the remote service that turns readings into
//! aggregate values.
//!
//! Uses enum dispatch ([`HistorianClient`]) over the concrete clients so
//! the pipeline can pick one at runtime without boxing async methods.
//!
//! - [`HttpHistorian`] talks to a historian service over HTTP via `reqwest`.
//! - [`LocalHistorian`] runs the historian logic in-process: it keeps
//!   every raw reading and answers with the running mean per device.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use aggregator_store::{AggregateStore, StoreError};
use aggregator_types::{AggregateKey, DeviceId, ErrorKind, Reading, ReadingId};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::retry::RetryClassify;

/// Default per-request timeout for [`HttpHistorian`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a historian call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistorianError {
    /// The call may succeed if repeated (timeouts, connection failures,
    /// 408/429/5xx responses).
    #[error("historian temporarily unavailable: {0}")]
    Transient(String),

    /// The call will not succeed as issued (rejected request, unreadable
    /// response).
    #[error("historian call failed: {0}")]
    Fatal(String),
}

impl HistorianError {
    /// Machine-readable classification.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientUpstreamError,
            Self::Fatal(_) => ErrorKind::FatalUpstreamError,
        }
    }
}

impl RetryClassify for HistorianError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A service that computes an aggregate for a reading.
///
/// `Ok(None)` means the historian answered but produced no value.
pub trait Historian: Send + Sync {
    /// Submit a reading and return the resulting aggregate.
    fn compute_aggregate(
        &self,
        reading: &Reading,
    ) -> impl Future<Output = Result<Option<f64>, HistorianError>> + Send;
}

// ---------------------------------------------------------------------------
// Unified client enum
// ---------------------------------------------------------------------------

/// A historian chosen at runtime.
#[derive(Debug, Clone)]
pub enum HistorianClient {
    /// Remote historian over HTTP.
    Http(HttpHistorian),
    /// In-process historian.
    Local(LocalHistorian),
}

impl HistorianClient {
    /// Human-readable name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Local(_) => "local",
        }
    }

    /// The in-process historian, when that is the active client.
    pub const fn as_local(&self) -> Option<&LocalHistorian> {
        match self {
            Self::Local(local) => Some(local),
            Self::Http(_) => None,
        }
    }
}

impl Historian for HistorianClient {
    async fn compute_aggregate(&self, reading: &Reading) -> Result<Option<f64>, HistorianError> {
        match self {
            Self::Http(client) => client.compute_aggregate(reading).await,
            Self::Local(local) => local.compute_aggregate(reading).await,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP historian
// ---------------------------------------------------------------------------

/// Historian reached over HTTP.
///
/// Sends `POST {base_url}/v1/deviceData/{deviceId}` with the data point id,
/// timestamp, and value as query parameters, and expects a JSON number
/// (or `null`) in the response body.
#[derive(Debug, Clone)]
pub struct HttpHistorian {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistorian {
    /// Create a client for the historian at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`HistorianError::Fatal`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HistorianError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HistorianError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, device_id: DeviceId) -> String {
        format!("{}/v1/deviceData/{device_id}", self.base_url)
    }
}

impl Historian for HttpHistorian {
    async fn compute_aggregate(&self, reading: &Reading) -> Result<Option<f64>, HistorianError> {
        let url = self.endpoint(reading.device_id);
        debug!(url = %url, reading_id = %reading.reading_id, "posting reading to historian");

        let response = self
            .client
            .post(&url)
            .query(&[
                ("datapointId", reading.reading_id.to_string()),
                ("timestamp", reading.timestamp.to_rfc3339()),
                ("value", reading.value.to_string()),
            ])
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            warn!(status = %status, "historian returned an error status");
            return Err(classify_status(status, &body));
        }

        response
            .json::<Option<f64>>()
            .await
            .map_err(|e| HistorianError::Fatal(format!("historian response parse failed: {e}")))
    }
}

fn classify_transport_error(error: reqwest::Error) -> HistorianError {
    if error.is_timeout() || error.is_connect() {
        HistorianError::Transient(format!("historian request failed: {error}"))
    } else {
        HistorianError::Fatal(format!("historian request failed: {error}"))
    }
}

fn classify_status(status: StatusCode, body: &str) -> HistorianError {
    let message = format!("historian returned {status}: {body}");
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        HistorianError::Transient(message)
    } else {
        HistorianError::Fatal(message)
    }
}

// ---------------------------------------------------------------------------
// In-process historian
// ---------------------------------------------------------------------------

/// Historian that runs in-process.
///
/// Raw readings are kept under `{deviceId};{dataPointId}`. The first value
/// recorded for a data point wins, so resubmitting the same reading is
/// idempotent. The aggregate is the mean of every reading for the device.
/// Clones share the same readings.
#[derive(Debug, Clone, Default)]
pub struct LocalHistorian {
    readings: Arc<AggregateStore>,
}

impl LocalHistorian {
    /// Create an empty historian.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one data point and return the device's mean.
    ///
    /// # Errors
    ///
    /// Returns [`HistorianError::Fatal`] if the value is not finite.
    pub fn ingest(
        &self,
        device_id: DeviceId,
        data_point_id: ReadingId,
        value: f64,
    ) -> Result<f64, HistorianError> {
        if !value.is_finite() {
            return Err(HistorianError::Fatal(format!(
                "reading value must be finite, got {value}"
            )));
        }

        let device = device_id.to_string();
        let key = AggregateKey::new(device.clone(), data_point_id.to_string());
        match self.readings.add(key, value) {
            Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(HistorianError::Fatal(e.to_string())),
        }

        self.readings
            .average_by_prefix(&AggregateKey::category_prefix(&device))
            .map_err(|e| HistorianError::Fatal(e.to_string()))
    }

    /// Number of distinct data points recorded.
    pub fn reading_count(&self) -> usize {
        self.readings.len()
    }
}

impl Historian for LocalHistorian {
    async fn compute_aggregate(&self, reading: &Reading) -> Result<Option<f64>, HistorianError> {
        self.ingest(reading.device_id, reading.reading_id, reading.value)
            .map(Some)
    }
}
