//! Axum router construction for the aggregator API.
//!
//! Assembles all routes into a single [`Router`] with CORS and HTTP
//! tracing middleware.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the complete Axum router.
///
/// The router includes:
/// - `POST /v1/deviceData/{deviceType}/{deviceId}` -- submit a reading
/// - `GET /v1/averageByDeviceType/{deviceType}` -- mean per device type
/// - `GET /v1/aggregates` -- every stored aggregate
/// - `POST /v1/historian/deviceData/{deviceId}` -- in-process historian
/// - `GET /health` -- liveness
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/v1/deviceData/{device_type}/{device_id}",
            post(handlers::submit_reading),
        )
        .route(
            "/v1/averageByDeviceType/{device_type}",
            get(handlers::average_by_device_type),
        )
        .route("/v1/aggregates", get(handlers::list_aggregates))
        .route(
            "/v1/historian/deviceData/{device_id}",
            post(handlers::historian_device_data),
        )
        .route("/health", get(handlers::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
