//! Conflict scenarios for the concurrency coordinator.
//!
//! [`RacingBackend`] wraps the in-memory backend and lets a scripted
//! "other writer" land a commit immediately before the coordinator's own
//! conditional write, reproducing the two-writers-read-the-same-version
//! race deterministically.

#![allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use aggregator_core::coordinator::{
    AGGREGATE_ENTITY, CommitOutcome, ConcurrencyCoordinator, CoordinatorConfig, CoordinatorError,
    ResolutionPolicy,
};
use aggregator_store::{MemoryRecordBackend, RecordBackend, StoreError, WriteOutcome};
use aggregator_types::{ErrorKind, FieldMap, FieldValue, RecordId, Version, VersionedRecord};

const INVENTORY: &str = "inventory";
const AVAILABLE: &str = "available_items";

struct RacingBackend {
    inner: MemoryRecordBackend,
    interlopers: Mutex<VecDeque<FieldMap>>,
}

impl RacingBackend {
    fn new(inner: MemoryRecordBackend, interlopers: impl IntoIterator<Item = FieldMap>) -> Self {
        Self {
            inner,
            interlopers: Mutex::new(interlopers.into_iter().collect()),
        }
    }
}

impl RecordBackend for RacingBackend {
    async fn read(&self, id: &RecordId) -> Result<VersionedRecord, StoreError> {
        self.inner.read(id).await
    }

    async fn conditional_write(
        &self,
        id: &RecordId,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<WriteOutcome, StoreError> {
        let theirs = self.interlopers.lock().unwrap().pop_front();
        if let Some(theirs) = theirs {
            let current = self.inner.read(id).await?;
            let outcome = self
                .inner
                .conditional_write(id, current.version, &theirs)
                .await?;
            assert!(matches!(outcome, WriteOutcome::Committed(_)));
        }
        self.inner.conditional_write(id, expected, fields).await
    }

    async fn create(
        &self,
        id: &RecordId,
        entity: &str,
        fields: &FieldMap,
    ) -> Result<Version, StoreError> {
        self.inner.create(id, entity, fields).await
    }
}

fn inventory(available: i64) -> FieldMap {
    FieldMap::from([
        ("item_name".to_owned(), FieldValue::from("ItemA")),
        (AVAILABLE.to_owned(), FieldValue::Integer(available)),
    ])
}

fn set_available(available: i64) -> impl FnMut(&mut FieldMap) + Send {
    move |fields| {
        fields.insert(AVAILABLE.to_owned(), FieldValue::Integer(available));
    }
}

async fn racing_coordinator(
    policy: ResolutionPolicy,
    entities: &[&str],
    interlopers: Vec<FieldMap>,
) -> (ConcurrencyCoordinator<RacingBackend>, RecordId, Version) {
    let inner = MemoryRecordBackend::new();
    let id = RecordId::new("item-a");
    let v0 = inner.create(&id, INVENTORY, &inventory(10)).await.unwrap();
    let config = CoordinatorConfig {
        policy,
        supported_entities: entities.iter().map(|e| (*e).to_owned()).collect::<BTreeSet<_>>(),
    };
    let backend = Arc::new(RacingBackend::new(inner, interlopers));
    (ConcurrencyCoordinator::new(backend, config), id, v0)
}

#[tokio::test]
async fn loser_sees_report_and_wins_after_one_retry() {
    let (coordinator, id, v0) =
        racing_coordinator(ResolutionPolicy::RetryOnce, &[INVENTORY], vec![inventory(100)]).await;

    let CommitOutcome {
        record,
        rounds,
        conflicts,
    } = coordinator.commit(&id, set_available(200)).await.unwrap();

    assert_eq!(rounds, 2);
    assert_eq!(conflicts.len(), 1);

    let report = &conflicts[0];
    assert_eq!(report.expected_version, v0);
    assert_ne!(report.current_version, v0);
    let field = report.field(AVAILABLE).expect("available_items conflict");
    assert_eq!(field.proposed, Some(FieldValue::Integer(200)));
    assert_eq!(field.original, Some(FieldValue::Integer(10)));
    assert_eq!(field.current, Some(FieldValue::Integer(100)));
    assert!(report.field("item_name").is_none());

    assert_eq!(record.field(AVAILABLE), Some(&FieldValue::Integer(200)));
    let stored = coordinator.backend().read(&id).await.unwrap();
    assert_eq!(stored, record);
}

#[tokio::test]
async fn report_only_abandons_without_overwriting() {
    let (coordinator, id, v0) =
        racing_coordinator(ResolutionPolicy::ReportOnly, &[INVENTORY], vec![inventory(100)]).await;

    let err = coordinator.commit(&id, set_available(200)).await.unwrap_err();

    let CoordinatorError::Abandoned { report, rounds } = &err else {
        panic!("expected abandonment, got {err:?}");
    };
    assert_eq!(*rounds, 1);
    assert_eq!(report.expected_version, v0);
    assert_eq!(err.kind(), ErrorKind::VersionConflict);
    assert!(err.to_string().contains("proposed 200, original 10, current 100"));

    let stored = coordinator.backend().read(&id).await.unwrap();
    assert_eq!(stored.field(AVAILABLE), Some(&FieldValue::Integer(100)));
}

#[tokio::test]
async fn second_conflict_abandons_retry_once() {
    let (coordinator, id, _) = racing_coordinator(
        ResolutionPolicy::RetryOnce,
        &[INVENTORY],
        vec![inventory(100), inventory(150)],
    )
    .await;

    let err = coordinator.commit(&id, set_available(200)).await.unwrap_err();

    let CoordinatorError::Abandoned { report, rounds } = err else {
        panic!("expected abandonment");
    };
    assert_eq!(rounds, 2);
    let field = report.field(AVAILABLE).unwrap();
    assert_eq!(field.original, Some(FieldValue::Integer(100)));
    assert_eq!(field.current, Some(FieldValue::Integer(150)));

    let stored = coordinator.backend().read(&id).await.unwrap();
    assert_eq!(stored.field(AVAILABLE), Some(&FieldValue::Integer(150)));
}

#[tokio::test]
async fn retry_up_to_outlasts_repeated_conflicts() {
    let (coordinator, id, _) = racing_coordinator(
        ResolutionPolicy::RetryUpTo(3),
        &[INVENTORY],
        vec![inventory(100), inventory(150), inventory(175)],
    )
    .await;

    let outcome = coordinator.commit(&id, set_available(200)).await.unwrap();

    assert_eq!(outcome.rounds, 4);
    assert_eq!(outcome.conflicts.len(), 3);
    assert_eq!(outcome.record.field(AVAILABLE), Some(&FieldValue::Integer(200)));
}

#[tokio::test]
async fn conflict_on_unsupported_entity_fails_fast() {
    let (coordinator, id, _) = racing_coordinator(
        ResolutionPolicy::RetryUpTo(10),
        &[AGGREGATE_ENTITY],
        vec![inventory(100)],
    )
    .await;

    let err = coordinator.commit(&id, set_available(200)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnsupportedEntity);
    let CoordinatorError::UnsupportedEntity { entity, report } = err else {
        panic!("expected unsupported entity");
    };
    assert_eq!(entity, INVENTORY);
    assert_eq!(report.fields.len(), 1);

    let stored = coordinator.backend().read(&id).await.unwrap();
    assert_eq!(stored.field(AVAILABLE), Some(&FieldValue::Integer(100)));
}

#[tokio::test]
async fn unsupported_entity_without_conflict_commits() {
    let (coordinator, id, _) =
        racing_coordinator(ResolutionPolicy::RetryOnce, &[AGGREGATE_ENTITY], vec![]).await;

    let outcome = coordinator.commit(&id, set_available(200)).await.unwrap();
    assert_eq!(outcome.rounds, 1);
}

#[tokio::test]
async fn retry_that_matches_current_state_writes_nothing() {
    let (coordinator, id, _) =
        racing_coordinator(ResolutionPolicy::RetryOnce, &[INVENTORY], vec![inventory(200)]).await;

    let outcome = coordinator.commit(&id, set_available(200)).await.unwrap();

    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.record.field(AVAILABLE), Some(&FieldValue::Integer(200)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_lose_no_updates() {
    const WRITERS: i64 = 16;

    let backend = MemoryRecordBackend::new();
    let id = RecordId::new("TEMP;counter");
    backend
        .create(
            &id,
            AGGREGATE_ENTITY,
            &FieldMap::from([("count".to_owned(), FieldValue::Integer(0))]),
        )
        .await
        .unwrap();

    let config = CoordinatorConfig {
        policy: ResolutionPolicy::RetryUpTo(u32::try_from(WRITERS).unwrap()),
        ..CoordinatorConfig::default()
    };
    let coordinator = ConcurrencyCoordinator::new(Arc::new(backend), config);

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move {
                coordinator
                    .commit(&id, |fields| {
                        let next = fields
                            .get("count")
                            .and_then(FieldValue::as_i64)
                            .unwrap_or(0)
                            .saturating_add(1);
                        fields.insert("count".to_owned(), FieldValue::Integer(next));
                    })
                    .await
            })
        })
        .collect();

    for outcome in futures::future::join_all(handles).await {
        outcome.unwrap().unwrap();
    }

    let stored = coordinator.backend().read(&id).await.unwrap();
    assert_eq!(stored.field("count"), Some(&FieldValue::Integer(WRITERS)));
}
