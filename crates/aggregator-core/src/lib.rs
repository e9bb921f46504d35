//! Resilient aggregation for device readings.
//!
//! This crate owns the path a reading takes from submission to a stored
//! aggregate: a historian call wrapped in exponential-backoff retry, an
//! optional optimistic-concurrency commit to a shared record backend, and
//! the final write into the local aggregate store.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `aggregator-config.yaml` into
//!   strongly-typed structs.
//! - [`retry`] -- [`ResilientRemoteInvoker`] and its [`RetryPolicy`].
//! - [`coordinator`] -- [`ConcurrencyCoordinator`] for versioned records.
//! - [`historian`] -- [`Historian`] trait with HTTP and in-process clients.
//! - [`pipeline`] -- [`AggregationPipeline`] tying the pieces together.
//!
//! [`ResilientRemoteInvoker`]: retry::ResilientRemoteInvoker
//! [`RetryPolicy`]: retry::RetryPolicy
//! [`ConcurrencyCoordinator`]: coordinator::ConcurrencyCoordinator
//! [`Historian`]: historian::Historian
//! [`AggregationPipeline`]: pipeline::AggregationPipeline

pub mod config;
pub mod coordinator;
pub mod historian;
pub mod pipeline;
pub mod retry;
