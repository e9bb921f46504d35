//! Integration tests for the aggregator API endpoints.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server. The pipeline runs against the in-process
//! historian unless a test says otherwise.

#![allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::float_cmp,
    clippy::indexing_slicing
)]

use std::sync::Arc;
use std::time::Duration;

use aggregator_api::build_router;
use aggregator_api::state::{AppState, ServicePipeline};
use aggregator_core::coordinator::{ConcurrencyCoordinator, CoordinatorConfig};
use aggregator_core::historian::{HistorianClient, HttpHistorian, LocalHistorian};
use aggregator_core::pipeline::AggregationPipeline;
use aggregator_core::retry::{ResilientRemoteInvoker, RetryPolicy};
use aggregator_store::{MemoryRecordBackend, RecordBackendClient};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

fn fast_invoker() -> ResilientRemoteInvoker {
    ResilientRemoteInvoker::new(RetryPolicy::new(2, Duration::from_millis(1)))
}

fn local_pipeline() -> ServicePipeline {
    AggregationPipeline::new(HistorianClient::Local(LocalHistorian::new()), fast_invoker())
        .with_optional_coordinator::<RecordBackendClient>(None)
}

fn make_router(pipeline: ServicePipeline) -> Router {
    build_router(Arc::new(AppState::new(pipeline)))
}

async fn send(router: &Router, method: &str, uri: &str) -> Response<Body> {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn submit_uri(device_type: &str, device: Uuid, value: f64) -> String {
    format!(
        "/v1/deviceData/{device_type}/{device}?dataPointId={}&value={value}",
        Uuid::new_v4()
    )
}

// =========================================================================
// Reading submission
// =========================================================================

#[tokio::test]
async fn test_submit_reading_returns_aggregate() {
    let router = make_router(local_pipeline());
    let device = Uuid::new_v4();

    let response = send(&router, "POST", &submit_uri("TEMP", device, 21.5)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_json(response.into_body()).await, 21.5);
}

#[tokio::test]
async fn test_second_reading_overwrites_aggregate() {
    let router = make_router(local_pipeline());
    let device = Uuid::new_v4();

    send(&router, "POST", &submit_uri("TEMP", device, 10.0)).await;
    let response = send(&router, "POST", &submit_uri("TEMP", device, 20.0)).await;
    assert_eq!(body_to_json(response.into_body()).await, 15.0);

    let response = send(&router, "GET", "/v1/aggregates").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    let entries = json.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["key"], format!("TEMP;{device}"));
    assert_eq!(entries[0]["value"], 15.0);
}

#[tokio::test]
async fn test_submit_without_data_point_id() {
    let router = make_router(local_pipeline());
    let uri = format!("/v1/deviceData/TEMP/{}?value=3.5", Uuid::new_v4());

    let response = send(&router, "POST", &uri).await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unsupported_device_type_is_bad_request() {
    let router = make_router(local_pipeline());

    let response = send(&router, "POST", &submit_uri("HUMIDITY", Uuid::new_v4(), 40.0)).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["code"], "unsupported_device_type");
    assert!(json["message"].as_str().unwrap().contains("HUMIDITY"));
}

#[tokio::test]
async fn test_invalid_device_id_is_bad_request() {
    let router = make_router(local_pipeline());

    let response = send(&router, "POST", "/v1/deviceData/TEMP/not-a-uuid?value=1").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["code"], "validation_error");
}

#[tokio::test]
async fn test_nil_device_id_is_bad_request() {
    let router = make_router(local_pipeline());

    let response = send(&router, "POST", &submit_uri("TEMP", Uuid::nil(), 1.0)).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["code"], "validation_error");
    assert!(json["message"].as_str().unwrap().contains("unsupported UUID version 0"));
}

#[tokio::test]
async fn test_missing_value_is_bad_request() {
    let router = make_router(local_pipeline());
    let uri = format!("/v1/deviceData/TEMP/{}", Uuid::new_v4());

    let response = send(&router, "POST", &uri).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["code"], "validation_error");
}

#[tokio::test]
async fn test_unreachable_historian_is_service_unavailable() {
    let historian = HttpHistorian::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
    let pipeline = AggregationPipeline::new(HistorianClient::Http(historian), fast_invoker())
        .with_optional_coordinator::<RecordBackendClient>(None);
    let router = make_router(pipeline);

    let response = send(&router, "POST", &submit_uri("TEMP", Uuid::new_v4(), 21.5)).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["code"], "transient_upstream_error");
}

// =========================================================================
// Queries
// =========================================================================

#[tokio::test]
async fn test_average_by_device_type() {
    let router = make_router(local_pipeline());
    send(&router, "POST", &submit_uri("TEMP", Uuid::new_v4(), 10.0)).await;
    send(&router, "POST", &submit_uri("TEMP", Uuid::new_v4(), 30.0)).await;

    let response = send(&router, "GET", "/v1/averageByDeviceType/TEMP").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["deviceType"], "TEMP");
    assert_eq!(json["average"], 20.0);
}

#[tokio::test]
async fn test_average_without_entries_is_not_found() {
    let router = make_router(local_pipeline());

    let response = send(&router, "GET", "/v1/averageByDeviceType/TEMP").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["code"], "no_matching_entries");
}

// =========================================================================
// In-process historian
// =========================================================================

#[tokio::test]
async fn test_historian_route_returns_created_mean() {
    let router = make_router(local_pipeline());
    let device = Uuid::new_v4();
    let first = Uuid::new_v4();
    let uri = |point: Uuid, value: f64| {
        format!(
            "/v1/historian/deviceData/{device}?datapointId={point}&timestamp=2026-01-01T00:00:00Z&value={value}"
        )
    };

    let response = send(&router, "POST", &uri(first, 10.0)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_to_json(response.into_body()).await, 10.0);

    let response = send(&router, "POST", &uri(Uuid::new_v4(), 30.0)).await;
    assert_eq!(body_to_json(response.into_body()).await, 20.0);

    // Same data point again: first value wins.
    let response = send(&router, "POST", &uri(first, 99.0)).await;
    assert_eq!(body_to_json(response.into_body()).await, 20.0);
}

#[tokio::test]
async fn test_historian_route_rejects_bad_data_point() {
    let router = make_router(local_pipeline());
    let uri = format!(
        "/v1/historian/deviceData/{}?datapointId=nope&value=1",
        Uuid::new_v4()
    );

    let response = send(&router, "POST", &uri).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =========================================================================
// Health
// =========================================================================

#[tokio::test]
async fn test_health_reports_wiring() {
    let router = make_router(local_pipeline());

    let response = send(&router, "GET", "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["historian"], "local");
    assert_eq!(json["record_backend"], "none");
    assert_eq!(json["aggregates"], 0);
}

#[tokio::test]
async fn test_shared_backend_is_reported_and_used() {
    let backend = Arc::new(RecordBackendClient::Memory(MemoryRecordBackend::new()));
    let coordinator =
        ConcurrencyCoordinator::new(Arc::clone(&backend), CoordinatorConfig::default());
    let pipeline = AggregationPipeline::new(
        HistorianClient::Local(LocalHistorian::new()),
        fast_invoker(),
    )
    .with_coordinator(coordinator);
    let router = make_router(pipeline);

    let response = send(&router, "POST", &submit_uri("TEMP", Uuid::new_v4(), 18.0)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_to_json(send(&router, "GET", "/health").await.into_body()).await;
    assert_eq!(json["record_backend"], "memory");
    assert_eq!(json["aggregates"], 1);

    let RecordBackendClient::Memory(memory) = backend.as_ref() else {
        panic!("constructed as memory backend");
    };
    assert_eq!(memory.records().len(), 1);
}
