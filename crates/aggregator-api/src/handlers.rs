//! REST API endpoint handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/deviceData/{deviceType}/{deviceId}` | Submit a reading, returns the aggregate |
//! | `GET` | `/v1/averageByDeviceType/{deviceType}` | Mean aggregate across a device type |
//! | `GET` | `/v1/aggregates` | Every stored aggregate |
//! | `POST` | `/v1/historian/deviceData/{deviceId}` | In-process historian, returns the device mean |
//! | `GET` | `/health` | Liveness and wiring summary |

use std::sync::Arc;

use aggregator_core::coordinator::ConcurrencyCoordinator;
use aggregator_types::{DeviceId, IdParseError, Reading, ReadingId};
use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameter and response structs
// ---------------------------------------------------------------------------

/// Query parameters for `POST /v1/deviceData/{deviceType}/{deviceId}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDataQuery {
    /// Data point UUID. A fresh one is generated when absent.
    pub data_point_id: Option<String>,
    /// Measured value.
    pub value: f64,
}

/// Query parameters for `POST /v1/historian/deviceData/{deviceId}`.
#[derive(Debug, Deserialize)]
pub struct HistorianQuery {
    /// Data point UUID.
    #[serde(rename = "datapointId")]
    pub data_point_id: String,
    /// When the value was recorded.
    pub timestamp: Option<DateTime<Utc>>,
    /// Measured value.
    pub value: f64,
}

/// Response of `GET /v1/averageByDeviceType/{deviceType}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTypeAverage {
    /// The queried device type.
    pub device_type: String,
    /// Mean of the device type's aggregates.
    pub average: f64,
}

/// One entry of `GET /v1/aggregates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    /// Rendered key, `{deviceType};{deviceId}`.
    pub key: String,
    /// Latest aggregate value.
    pub value: f64,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Always `ok` when the server answers.
    pub status: String,
    /// Active historian client.
    pub historian: String,
    /// Shared record backend, or `none`.
    pub record_backend: String,
    /// Number of stored aggregates.
    pub aggregates: usize,
    /// When the server started.
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Submit a reading and return the committed aggregate.
///
/// # Errors
///
/// Returns [`ApiError`] for malformed parameters and for every pipeline
/// failure.
pub async fn submit_reading(
    State(state): State<Arc<AppState>>,
    Path((device_type, device_id)): Path<(String, String)>,
    query: Result<Query<DeviceDataQuery>, QueryRejection>,
) -> Result<Json<f64>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::Validation(e.body_text()))?;
    let device_id: DeviceId = parse_id(&device_id, "deviceId")?;
    let reading_id: ReadingId = query
        .data_point_id
        .as_deref()
        .map_or_else(|| Ok(ReadingId::new()), |raw| parse_id(raw, "dataPointId"))?;

    let reading = Reading::now(device_type, device_id, reading_id, query.value);
    let value = state.pipeline.submit(&reading).await?;
    Ok(Json(value))
}

/// Mean aggregate across every device of a type.
///
/// # Errors
///
/// Returns [`ApiError`] for unsupported types or when no aggregate exists.
pub async fn average_by_device_type(
    State(state): State<Arc<AppState>>,
    Path(device_type): Path<String>,
) -> Result<Json<DeviceTypeAverage>, ApiError> {
    let average = state.pipeline.average_by_device_type(&device_type)?;
    Ok(Json(DeviceTypeAverage {
        device_type,
        average,
    }))
}

/// Every stored aggregate, ordered by key.
pub async fn list_aggregates(State(state): State<Arc<AppState>>) -> Json<Vec<AggregateEntry>> {
    let entries = state
        .pipeline
        .snapshot()
        .into_iter()
        .map(|(key, value)| AggregateEntry {
            key: key.to_string(),
            value,
        })
        .collect();
    Json(entries)
}

/// Record a data point with the in-process historian and return the
/// device's mean with `201 Created`.
///
/// # Errors
///
/// Returns [`ApiError::Validation`] for malformed parameters.
pub async fn historian_device_data(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    query: Result<Query<HistorianQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::Validation(e.body_text()))?;
    let device_id: DeviceId = parse_id(&device_id, "deviceId")?;
    let data_point_id: ReadingId = parse_id(&query.data_point_id, "datapointId")?;
    if !query.value.is_finite() {
        return Err(ApiError::Validation(format!(
            "value must be finite, got {}",
            query.value
        )));
    }

    debug!(
        device_id = %device_id,
        data_point_id = %data_point_id,
        timestamp = ?query.timestamp,
        "historian data point received"
    );
    let average = state
        .local_historian
        .ingest(device_id, data_point_id, query.value)?;
    Ok((StatusCode::CREATED, Json(average)))
}

/// Liveness and wiring summary.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    let pipeline = &state.pipeline;
    Json(HealthStatus {
        status: "ok".to_owned(),
        historian: pipeline.historian().name().to_owned(),
        record_backend: pipeline
            .coordinator()
            .map(ConcurrencyCoordinator::backend)
            .map_or("none", |backend| backend.name())
            .to_owned(),
        aggregates: pipeline.store().len(),
        started_at: state.started_at,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a UUID-backed identifier from a request parameter.
fn parse_id<T>(raw: &str, name: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr<Err = IdParseError>,
{
    raw.parse()
        .map_err(|e| ApiError::Validation(format!("{name} must be a UUID, got '{raw}': {e}")))
}
