//! Process-local versioned-record backend.
//!
//! Records live in a mutex-guarded map. Versions come from one counter
//! shared by every record in the backend, so a token is never reused, much
//! like a database's row-modification counter. Each compare-and-write runs
//! inside a single critical section.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aggregator_types::{FieldMap, RecordId, Version, VersionedRecord};

use crate::error::StoreError;
use crate::record_backend::{RecordBackend, WriteOutcome};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<RecordId, VersionedRecord>,
    last_version: u64,
}

impl Inner {
    fn next_version(&mut self) -> Version {
        self.last_version = self.last_version.saturating_add(1);
        Version(self.last_version)
    }
}

/// In-memory [`RecordBackend`]. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRecordBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored record, ordered by ID.
    pub fn records(&self) -> Vec<VersionedRecord> {
        self.lock().records.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordBackend for MemoryRecordBackend {
    async fn read(&self, id: &RecordId) -> Result<VersionedRecord, StoreError> {
        self.lock()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn conditional_write(
        &self,
        id: &RecordId,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        let current = inner
            .records
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.version != expected {
            return Ok(WriteOutcome::VersionMismatch(current.clone()));
        }

        let version = inner.next_version();
        if let Some(record) = inner.records.get_mut(id) {
            record.fields.clone_from(fields);
            record.version = version;
        }
        drop(inner);

        tracing::trace!(record_id = %id, %version, "memory backend committed write");
        Ok(WriteOutcome::Committed(version))
    }

    async fn create(
        &self,
        id: &RecordId,
        entity: &str,
        fields: &FieldMap,
    ) -> Result<Version, StoreError> {
        let mut inner = self.lock();
        if inner.records.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let version = inner.next_version();
        inner.records.insert(
            id.clone(),
            VersionedRecord {
                id: id.clone(),
                entity: entity.to_owned(),
                fields: fields.clone(),
                version,
            },
        );
        Ok(version)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use aggregator_types::FieldValue;

    use super::*;

    fn fields(available: i64) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("available".to_owned(), FieldValue::Integer(available));
        fields
    }

    #[tokio::test]
    async fn create_then_read() {
        let backend = MemoryRecordBackend::new();
        let id = RecordId::new("item");
        let version = backend.create(&id, "inventory", &fields(10)).await.unwrap();

        let record = backend.read(&id).await.unwrap();
        assert_eq!(record.version, version);
        assert_eq!(record.entity, "inventory");
        assert_eq!(record.field("available"), Some(&FieldValue::Integer(10)));
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let backend = MemoryRecordBackend::new();
        let id = RecordId::new("item");
        backend.create(&id, "inventory", &fields(10)).await.unwrap();
        let result = backend.create(&id, "inventory", &fields(20)).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn matching_version_commits_and_advances() {
        let backend = MemoryRecordBackend::new();
        let id = RecordId::new("item");
        let v0 = backend.create(&id, "inventory", &fields(10)).await.unwrap();

        let outcome = backend.conditional_write(&id, v0, &fields(100)).await.unwrap();
        let WriteOutcome::Committed(v1) = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert!(v1 > v0);
        assert_eq!(
            backend.read(&id).await.unwrap().field("available"),
            Some(&FieldValue::Integer(100))
        );
    }

    #[tokio::test]
    async fn stale_version_reports_current_record() {
        let backend = MemoryRecordBackend::new();
        let id = RecordId::new("item");
        let v0 = backend.create(&id, "inventory", &fields(10)).await.unwrap();
        backend.conditional_write(&id, v0, &fields(100)).await.unwrap();

        let outcome = backend.conditional_write(&id, v0, &fields(200)).await.unwrap();
        let WriteOutcome::VersionMismatch(current) = outcome else {
            panic!("expected mismatch, got {outcome:?}");
        };
        assert_eq!(current.field("available"), Some(&FieldValue::Integer(100)));
        assert_ne!(current.version, v0);
    }

    #[tokio::test]
    async fn versions_are_unique_across_records() {
        let backend = MemoryRecordBackend::new();
        let a = backend.create(&RecordId::new("a"), "inventory", &fields(1)).await.unwrap();
        let b = backend.create(&RecordId::new("b"), "inventory", &fields(1)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.records().len(), 2);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let backend = MemoryRecordBackend::new();
        let id = RecordId::new("ghost");
        assert!(matches!(backend.read(&id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            backend.conditional_write(&id, Version::INITIAL, &fields(1)).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
