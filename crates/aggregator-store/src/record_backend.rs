//! Versioned-record backend contract.
//!
//! A backend stores [`VersionedRecord`]s and offers compare-and-swap on the
//! version token: [`RecordBackend::conditional_write`] succeeds only if the
//! stored version still equals the one the writer read. Each conditional
//! write is atomic, so a dropped caller future never leaves a partial write
//! behind.
//!
//! Two implementations exist, dispatched through [`RecordBackendClient`]:
//!
//! - [`MemoryRecordBackend`] -- process-local, for tests and single-node use
//! - [`PgRecordBackend`] -- `PostgreSQL`, shared across processes

use std::future::Future;

use aggregator_types::{FieldMap, RecordId, Version, VersionedRecord};

use crate::error::StoreError;
use crate::memory_backend::MemoryRecordBackend;
use crate::pg_backend::PgRecordBackend;

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The write was applied; the backend assigned this new version.
    Committed(Version),
    /// The stored version moved since the writer read it. Carries the
    /// record as it is stored now.
    VersionMismatch(VersionedRecord),
}

/// Storage that supports compare-and-swap on a record version.
pub trait RecordBackend: Send + Sync {
    /// Read the current state of a record.
    ///
    /// Fails with [`StoreError::NotFound`] if the record does not exist.
    fn read(
        &self,
        id: &RecordId,
    ) -> impl Future<Output = Result<VersionedRecord, StoreError>> + Send;

    /// Replace the fields of a record if its stored version equals
    /// `expected`.
    ///
    /// Fails with [`StoreError::NotFound`] if the record does not exist.
    fn conditional_write(
        &self,
        id: &RecordId,
        expected: Version,
        fields: &FieldMap,
    ) -> impl Future<Output = Result<WriteOutcome, StoreError>> + Send;

    /// Create a record, returning its first version.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the ID is taken.
    fn create(
        &self,
        id: &RecordId,
        entity: &str,
        fields: &FieldMap,
    ) -> impl Future<Output = Result<Version, StoreError>> + Send;
}

/// A versioned-record backend selected at runtime.
///
/// Uses enum dispatch because the trait's async methods are not
/// dyn-compatible.
#[derive(Debug, Clone)]
pub enum RecordBackendClient {
    /// Process-local backend.
    Memory(MemoryRecordBackend),
    /// `PostgreSQL` backend.
    Postgres(PgRecordBackend),
}

impl RecordBackendClient {
    /// Human-readable name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Postgres(_) => "postgres",
        }
    }
}

impl RecordBackend for RecordBackendClient {
    async fn read(&self, id: &RecordId) -> Result<VersionedRecord, StoreError> {
        match self {
            Self::Memory(backend) => backend.read(id).await,
            Self::Postgres(backend) => backend.read(id).await,
        }
    }

    async fn conditional_write(
        &self,
        id: &RecordId,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<WriteOutcome, StoreError> {
        match self {
            Self::Memory(backend) => backend.conditional_write(id, expected, fields).await,
            Self::Postgres(backend) => backend.conditional_write(id, expected, fields).await,
        }
    }

    async fn create(
        &self,
        id: &RecordId,
        entity: &str,
        fields: &FieldMap,
    ) -> Result<Version, StoreError> {
        match self {
            Self::Memory(backend) => backend.create(id, entity, fields).await,
            Self::Postgres(backend) => backend.create(id, entity, fields).await,
        }
    }
}
