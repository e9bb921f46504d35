//! The aggregation pipeline: validate a reading, ask the historian for an
//! aggregate, and commit the result.
//!
//! A submitted reading flows through:
//!
//! 1. validation of the device type and value;
//! 2. the historian, called through the [`ResilientRemoteInvoker`];
//! 3. the shared record backend, if one is configured, via
//!    [`ConcurrencyCoordinator::commit_or_create`];
//! 4. the local [`AggregateStore`], where the new value replaces any
//!    previous one for the same device. With a shared backend the local
//!    entry mirrors the committed record and never moves back to an older
//!    version.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use aggregator_store::{AggregateStore, MemoryRecordBackend, RecordBackend, StoreError};
use aggregator_types::{AggregateKey, ErrorKind, FieldValue, Reading, RecordId};
use tracing::{debug, info, warn};

use crate::coordinator::{AGGREGATE_ENTITY, ConcurrencyCoordinator, CoordinatorError};
use crate::historian::{Historian, HistorianError};
use crate::retry::{InvokeError, ResilientRemoteInvoker};

/// Field holding the aggregate value in shared records.
pub const VALUE_FIELD: &str = "value";

/// Device type accepted when no other set is configured.
pub const DEFAULT_DEVICE_TYPE: &str = "TEMP";

/// Failure of a pipeline operation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The reading is malformed.
    #[error("invalid reading: {0}")]
    Validation(String),

    /// The device type is not in the supported set.
    #[error("unsupported device type '{0}'")]
    UnsupportedDeviceType(String),

    /// The historian call failed.
    #[error(transparent)]
    Historian(#[from] InvokeError<HistorianError>),

    /// The historian answered without a value.
    #[error("cannot calculate the average for {0}")]
    NoAggregateProduced(AggregateKey),

    /// The shared commit failed.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// The local store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Machine-readable classification.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::UnsupportedDeviceType(_) => ErrorKind::UnsupportedDeviceType,
            Self::Historian(e) => e.kind(),
            Self::NoAggregateProduced(_) => ErrorKind::NoAggregateProduced,
            Self::Coordinator(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Turns readings into stored aggregates.
///
/// `H` is the historian; `B` is the shared record backend, unused unless a
/// coordinator is attached with [`with_coordinator`](Self::with_coordinator).
#[derive(Debug)]
pub struct AggregationPipeline<H, B = MemoryRecordBackend> {
    store: Arc<AggregateStore>,
    historian: H,
    invoker: ResilientRemoteInvoker,
    coordinator: Option<ConcurrencyCoordinator<B>>,
    supported_device_types: BTreeSet<String>,
}

impl<H: Historian> AggregationPipeline<H> {
    /// Create a pipeline with an empty store, no shared backend, and only
    /// `TEMP` readings accepted.
    pub fn new(historian: H, invoker: ResilientRemoteInvoker) -> Self {
        Self {
            store: Arc::new(AggregateStore::new()),
            historian,
            invoker,
            coordinator: None,
            supported_device_types: BTreeSet::from([DEFAULT_DEVICE_TYPE.to_owned()]),
        }
    }
}

impl<H: Historian, B: RecordBackend> AggregationPipeline<H, B> {
    /// Use `store` for aggregates instead of a private one.
    #[must_use]
    pub fn with_store(mut self, store: Arc<AggregateStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the set of accepted device types.
    #[must_use]
    pub fn with_supported_device_types<I, S>(mut self, device_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_device_types = device_types.into_iter().map(Into::into).collect();
        self
    }

    /// Also commit every aggregate to a shared versioned-record backend.
    pub fn with_coordinator<C: RecordBackend>(
        self,
        coordinator: ConcurrencyCoordinator<C>,
    ) -> AggregationPipeline<H, C> {
        self.with_optional_coordinator(Some(coordinator))
    }

    /// Attach a coordinator when one is given; `None` keeps aggregates
    /// local while fixing the backend type.
    pub fn with_optional_coordinator<C: RecordBackend>(
        self,
        coordinator: Option<ConcurrencyCoordinator<C>>,
    ) -> AggregationPipeline<H, C> {
        AggregationPipeline {
            store: self.store,
            historian: self.historian,
            invoker: self.invoker,
            coordinator,
            supported_device_types: self.supported_device_types,
        }
    }

    /// The local aggregate store.
    pub const fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    /// The historian in use.
    pub const fn historian(&self) -> &H {
        &self.historian
    }

    /// The shared-record coordinator, if attached.
    pub const fn coordinator(&self) -> Option<&ConcurrencyCoordinator<B>> {
        self.coordinator.as_ref()
    }

    /// Whether readings of `device_type` are accepted.
    pub fn is_supported(&self, device_type: &str) -> bool {
        self.supported_device_types.contains(device_type)
    }

    /// Submit a reading and return the aggregate committed for its device.
    ///
    /// The committed value replaces any previous value for the same
    /// `{device_type};{device_id}` key.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Validation`] for an empty device type or a
    ///   non-finite value.
    /// - [`PipelineError::UnsupportedDeviceType`] for types outside the
    ///   configured set; the historian is not called.
    /// - [`PipelineError::Historian`] when the historian fails fatally or
    ///   keeps failing transiently.
    /// - [`PipelineError::NoAggregateProduced`] when the historian answers
    ///   without a value.
    /// - [`PipelineError::Coordinator`] / [`PipelineError::Store`] when the
    ///   commit fails.
    pub async fn submit(&self, reading: &Reading) -> Result<f64, PipelineError> {
        let key = self.validate(reading)?;
        debug!(key = %key, reading_id = %reading.reading_id, "reading accepted");

        let historian = &self.historian;
        let aggregate = self
            .invoker
            .invoke(|| historian.compute_aggregate(reading))
            .await?;

        let Some(value) = aggregate else {
            warn!(key = %key, "historian produced no aggregate");
            return Err(PipelineError::NoAggregateProduced(key));
        };

        let Some(coordinator) = &self.coordinator else {
            self.commit_local(&key, value)?;
            info!(key = %key, value, "aggregate committed");
            return Ok(value);
        };

        let id = RecordId::from(&key);
        let outcome = coordinator
            .commit_or_create(&id, AGGREGATE_ENTITY, |fields| {
                fields.insert(VALUE_FIELD.to_owned(), FieldValue::Float(value));
            })
            .await?;
        let version = outcome.record.version;
        let committed = match outcome.record.field(VALUE_FIELD) {
            Some(FieldValue::Float(committed)) => *committed,
            other => {
                return Err(PipelineError::Store(StoreError::Corrupt(format!(
                    "record {id} at {version} has no numeric '{VALUE_FIELD}' field: {other:?}"
                ))));
            }
        };
        debug!(
            key = %key,
            version = %version,
            rounds = outcome.rounds,
            conflicts = outcome.conflicts.len(),
            "shared aggregate committed"
        );

        if self.store.apply_versioned(&key, committed, version) {
            info!(key = %key, value = committed, version = %version, "aggregate committed");
        } else {
            debug!(
                key = %key,
                version = %version,
                "local aggregate already holds a newer version"
            );
        }
        Ok(committed)
    }

    /// Mean of every stored aggregate whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] wrapping
    /// [`StoreError::NoMatchingEntries`] when nothing matches.
    pub fn average_by_prefix(&self, prefix: &str) -> Result<f64, PipelineError> {
        Ok(self.store.average_by_prefix(prefix)?)
    }

    /// Mean of every stored aggregate for `device_type`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnsupportedDeviceType`] for types outside
    /// the configured set, or the errors of
    /// [`average_by_prefix`](Self::average_by_prefix).
    pub fn average_by_device_type(&self, device_type: &str) -> Result<f64, PipelineError> {
        if !self.is_supported(device_type) {
            return Err(PipelineError::UnsupportedDeviceType(device_type.to_owned()));
        }
        self.average_by_prefix(&AggregateKey::category_prefix(device_type))
    }

    /// Copy of every stored aggregate.
    pub fn snapshot(&self) -> BTreeMap<AggregateKey, f64> {
        self.store.get_all()
    }

    fn validate(&self, reading: &Reading) -> Result<AggregateKey, PipelineError> {
        if reading.device_type.is_empty() {
            return Err(PipelineError::Validation(
                "device type must not be empty".to_owned(),
            ));
        }
        if !self.is_supported(&reading.device_type) {
            warn!(device_type = %reading.device_type, "rejecting unsupported device type");
            return Err(PipelineError::UnsupportedDeviceType(
                reading.device_type.clone(),
            ));
        }
        if !reading.value.is_finite() {
            return Err(PipelineError::Validation(format!(
                "value must be finite, got {}",
                reading.value
            )));
        }
        Ok(AggregateKey::new(
            reading.device_type.clone(),
            reading.device_id.to_string(),
        ))
    }

    /// Add the value, or overwrite it if the key already exists.
    fn commit_local(&self, key: &AggregateKey, value: f64) -> Result<(), StoreError> {
        if self.store.exists(key) {
            return self.store.update(key, value);
        }
        match self.store.add(key.clone(), value) {
            Err(StoreError::AlreadyExists(_)) => {
                debug!(key = %key, "aggregate added concurrently, updating instead");
                self.store.update(key, value)
            }
            other => other,
        }
    }
}
