//! HTTP API for the device aggregator.
//!
//! This crate provides an Axum HTTP server that exposes:
//!
//! - **Reading submission** (`POST /v1/deviceData/...`) running the full
//!   aggregation pipeline
//! - **Aggregate queries** (per device type average, full listing)
//! - **In-process historian** (`POST /v1/historian/deviceData/...`) so a
//!   single binary can play both roles
//! - **Health** (`GET /health`)
//!
//! Every error is returned as `{"code": ..., "message": ...}` with a
//! status derived from its [`ErrorKind`](aggregator_types::ErrorKind).

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

// Re-export primary types for convenience.
pub use error::{ApiError, ErrorBody};
pub use router::build_router;
pub use server::{ServerError, start_server};
pub use state::{AppState, ServicePipeline};
