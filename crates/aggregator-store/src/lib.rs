//! Storage layer for the device aggregator.
//!
//! Two kinds of state live here:
//!
//! - the [`AggregateStore`], a process-local map from aggregate key to the
//!   latest computed value, guarded by a reader-writer lock;
//! - versioned records behind the [`RecordBackend`] trait, which offers
//!   compare-and-swap on a version token so concurrent writers can detect
//!   lost updates.
//!
//! # Architecture
//!
//! ```text
//! AggregationPipeline
//!     |
//!     +-- add / update / average --> AggregateStore (RwLock<BTreeMap>)
//!     |
//!     +-- optimistic commit -------> RecordBackendClient
//!                                      |-- MemoryRecordBackend
//!                                      +-- PgRecordBackend (PostgreSQL)
//! ```
//!
//! # Modules
//!
//! - [`aggregate_store`] -- Concurrency-safe key/value aggregate store
//! - [`record_backend`] -- Backend trait, write outcome, runtime dispatch
//! - [`memory_backend`] -- In-memory versioned-record backend
//! - [`pg_backend`] -- `PostgreSQL` versioned-record backend
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`error`] -- Shared error types

pub mod aggregate_store;
pub mod error;
pub mod memory_backend;
pub mod pg_backend;
pub mod postgres;
pub mod record_backend;

// Re-export primary types for convenience.
pub use aggregate_store::AggregateStore;
pub use error::StoreError;
pub use memory_backend::MemoryRecordBackend;
pub use pg_backend::{PgRecordBackend, RecordRow};
pub use postgres::{PoolSettings, PostgresPool};
pub use record_backend::{RecordBackend, RecordBackendClient, WriteOutcome};
