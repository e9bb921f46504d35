//! Optimistic concurrency over versioned records.
//!
//! A commit reads the record, applies a mutation to a copy of its fields,
//! and writes the copy back only if the stored version is still the one
//! that was read. When another writer got there first the backend answers
//! with the current record, the coordinator builds a [`ConflictReport`],
//! and the configured [`ResolutionPolicy`] decides whether to recompute the
//! mutation against the fresh record or give up.
//!
//! # State machine
//!
//! ```text
//! Pending -> Committing -> Committed
//!                      \-> Conflicted -> Resolving -> Committing
//!                                                \-> Abandoned
//! ```
//!
//! Every transition is logged at `debug` with the record ID.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use aggregator_store::{RecordBackend, StoreError, WriteOutcome};
use aggregator_types::{ConflictReport, ErrorKind, FieldMap, RecordId, VersionedRecord};
use tracing::{debug, info, warn};

/// Entity tag used for aggregate records.
pub const AGGREGATE_ENTITY: &str = "aggregate";

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a single commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// Mutation computed, nothing written yet.
    Pending,
    /// Conditional write in flight.
    Committing,
    /// The write landed.
    Committed,
    /// The stored version moved since the read.
    Conflicted,
    /// The resolution policy is deciding what to do.
    Resolving,
    /// The commit was given up.
    Abandoned,
}

impl CommitState {
    /// Whether `next` is a legal successor of this state.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Resolving, Self::Committing)
                | (Self::Committing, Self::Committed | Self::Conflicted)
                | (Self::Conflicted, Self::Resolving)
                | (Self::Resolving, Self::Abandoned)
        )
    }

    /// `true` for states a commit never leaves.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Abandoned)
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Conflicted => "conflicted",
            Self::Resolving => "resolving",
            Self::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Tracks and logs the state of one commit.
struct CommitTrace<'a> {
    record_id: &'a RecordId,
    state: CommitState,
}

impl<'a> CommitTrace<'a> {
    const fn new(record_id: &'a RecordId) -> Self {
        Self {
            record_id,
            state: CommitState::Pending,
        }
    }

    fn enter(&mut self, next: CommitState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal commit transition {} -> {next}",
            self.state
        );
        debug!(
            record_id = %self.record_id,
            from = %self.state,
            to = %next,
            "commit state transition"
        );
        self.state = next;
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do after a version conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionPolicy {
    /// Recompute the mutation against the fresh record and try once more.
    #[default]
    RetryOnce,
    /// Give up on the first conflict and hand back the report.
    ReportOnly,
    /// Recompute and retry up to `n` times.
    RetryUpTo(u32),
}

impl ResolutionPolicy {
    /// Number of re-attempts allowed after the first write.
    pub const fn max_retries(self) -> u32 {
        match self {
            Self::RetryOnce => 1,
            Self::ReportOnly => 0,
            Self::RetryUpTo(n) => n,
        }
    }
}

/// Settings for a [`ConcurrencyCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Conflict resolution policy.
    pub policy: ResolutionPolicy,
    /// Entity tags the coordinator resolves conflicts for. Conflicts on any
    /// other entity fail with [`CoordinatorError::UnsupportedEntity`].
    pub supported_entities: BTreeSet<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            policy: ResolutionPolicy::default(),
            supported_entities: BTreeSet::from([AGGREGATE_ENTITY.to_owned()]),
        }
    }
}

impl CoordinatorConfig {
    /// Whether conflicts on `entity` may be resolved.
    pub fn supports(&self, entity: &str) -> bool {
        self.supported_entities.contains(entity)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// The record as stored after the commit.
    pub record: VersionedRecord,
    /// Writes attempted. Zero when the mutation changed nothing.
    pub rounds: u32,
    /// Conflicts met and resolved on the way.
    pub conflicts: Vec<ConflictReport>,
}

/// Failure of a commit.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The resolution policy gave up.
    #[error("commit abandoned after {rounds} round(s): {report}")]
    Abandoned {
        /// The conflict that ended the commit.
        report: ConflictReport,
        /// Writes attempted.
        rounds: u32,
    },

    /// The conflicting record's entity is not in the supported set.
    #[error("conflict on unsupported entity '{entity}': {report}")]
    UnsupportedEntity {
        /// The record's entity tag.
        entity: String,
        /// The conflict that was detected.
        report: ConflictReport,
    },
}

impl CoordinatorError {
    /// Machine-readable classification.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Abandoned { .. } => ErrorKind::VersionConflict,
            Self::UnsupportedEntity { .. } => ErrorKind::UnsupportedEntity,
        }
    }

    /// The conflict report, if the failure was a conflict.
    pub const fn report(&self) -> Option<&ConflictReport> {
        match self {
            Self::Abandoned { report, .. } | Self::UnsupportedEntity { report, .. } => {
                Some(report)
            }
            Self::Store(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Commits mutations to versioned records without lost updates.
///
/// Holds no lock between read and write; concurrent commits on the same
/// record race at the backend's conditional write and exactly one wins per
/// round.
pub struct ConcurrencyCoordinator<B> {
    backend: Arc<B>,
    config: CoordinatorConfig,
}

impl<B> Clone for ConcurrencyCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
        }
    }
}

impl<B> fmt::Debug for ConcurrencyCoordinator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: RecordBackend> ConcurrencyCoordinator<B> {
    /// Create a coordinator over a shared backend.
    pub const fn new(backend: Arc<B>, config: CoordinatorConfig) -> Self {
        Self { backend, config }
    }

    /// The backend commits go to.
    pub const fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Settings in effect.
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Apply `mutate` to the record `id` and commit the result.
    ///
    /// `mutate` may run more than once: after a resolved conflict it is
    /// applied again to the fresh record. If it leaves the fields
    /// unchanged nothing is written.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::Store`] if the record does not exist or the
    ///   backend fails.
    /// - [`CoordinatorError::Abandoned`] when the policy gives up.
    /// - [`CoordinatorError::UnsupportedEntity`] on a conflict for an entity
    ///   outside the supported set.
    pub async fn commit<M>(
        &self,
        id: &RecordId,
        mut mutate: M,
    ) -> Result<CommitOutcome, CoordinatorError>
    where
        M: FnMut(&mut FieldMap) + Send,
    {
        let original = self.backend.read(id).await?;
        self.commit_from(original, &mut mutate).await
    }

    /// Like [`commit`](Self::commit), but creates the record with entity
    /// tag `entity` from the mutated empty field map when it does not
    /// exist yet.
    ///
    /// If another writer creates the record first, falls back to a normal
    /// commit against their version.
    ///
    /// # Errors
    ///
    /// Same as [`commit`](Self::commit), minus the missing-record case.
    pub async fn commit_or_create<M>(
        &self,
        id: &RecordId,
        entity: &str,
        mut mutate: M,
    ) -> Result<CommitOutcome, CoordinatorError>
    where
        M: FnMut(&mut FieldMap) + Send,
    {
        match self.backend.read(id).await {
            Ok(original) => return self.commit_from(original, &mut mutate).await,
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut fields = FieldMap::new();
        mutate(&mut fields);

        match self.backend.create(id, entity, &fields).await {
            Ok(version) => {
                info!(record_id = %id, entity, version = %version, "record created");
                Ok(CommitOutcome {
                    record: VersionedRecord {
                        id: id.clone(),
                        entity: entity.to_owned(),
                        fields,
                        version,
                    },
                    rounds: 1,
                    conflicts: Vec::new(),
                })
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(record_id = %id, "record created concurrently, committing against it");
                let original = self.backend.read(id).await?;
                self.commit_from(original, &mut mutate).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_from<M>(
        &self,
        mut original: VersionedRecord,
        mutate: &mut M,
    ) -> Result<CommitOutcome, CoordinatorError>
    where
        M: FnMut(&mut FieldMap) + Send,
    {
        let record_id = original.id.clone();
        let mut trace = CommitTrace::new(&record_id);
        let mut rounds: u32 = 0;
        let mut conflicts = Vec::new();

        loop {
            let mut proposed = original.fields.clone();
            mutate(&mut proposed);

            if proposed == original.fields {
                debug!(
                    record_id = %record_id,
                    version = %original.version,
                    "mutation left record unchanged, nothing to write"
                );
                return Ok(CommitOutcome {
                    record: original,
                    rounds,
                    conflicts,
                });
            }

            trace.enter(CommitState::Committing);
            rounds = rounds.saturating_add(1);

            let outcome = self
                .backend
                .conditional_write(&record_id, original.version, &proposed)
                .await?;

            let current = match outcome {
                WriteOutcome::Committed(version) => {
                    trace.enter(CommitState::Committed);
                    info!(
                        record_id = %record_id,
                        from_version = %original.version,
                        to_version = %version,
                        rounds,
                        "commit succeeded"
                    );
                    return Ok(CommitOutcome {
                        record: VersionedRecord {
                            fields: proposed,
                            version,
                            ..original
                        },
                        rounds,
                        conflicts,
                    });
                }
                WriteOutcome::VersionMismatch(current) => current,
            };

            trace.enter(CommitState::Conflicted);
            let report = ConflictReport::between(&original, &proposed, &current);
            warn!(
                record_id = %record_id,
                expected_version = %report.expected_version,
                current_version = %report.current_version,
                conflicting_fields = report.fields.len(),
                round = rounds,
                "write conflict detected"
            );
            for field in &report.fields {
                debug!(
                    record_id = %record_id,
                    field = %field.field,
                    proposed = ?field.proposed,
                    original = ?field.original,
                    current = ?field.current,
                    "conflicting field"
                );
            }

            trace.enter(CommitState::Resolving);

            if !self.config.supports(&current.entity) {
                trace.enter(CommitState::Abandoned);
                return Err(CoordinatorError::UnsupportedEntity {
                    entity: current.entity,
                    report,
                });
            }

            let retries_used = rounds.saturating_sub(1);
            if retries_used >= self.config.policy.max_retries() {
                trace.enter(CommitState::Abandoned);
                warn!(record_id = %record_id, rounds, "commit abandoned");
                return Err(CoordinatorError::Abandoned { report, rounds });
            }

            conflicts.push(report);
            original = current;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use aggregator_store::MemoryRecordBackend;
    use aggregator_types::FieldValue;

    use super::*;

    fn counter_fields(n: i64) -> FieldMap {
        FieldMap::from([("count".to_owned(), FieldValue::Integer(n))])
    }

    async fn coordinator_with(
        policy: ResolutionPolicy,
    ) -> (ConcurrencyCoordinator<MemoryRecordBackend>, RecordId) {
        let backend = MemoryRecordBackend::new();
        let id = RecordId::new("counter");
        backend
            .create(&id, AGGREGATE_ENTITY, &counter_fields(0))
            .await
            .unwrap();
        let config = CoordinatorConfig {
            policy,
            ..CoordinatorConfig::default()
        };
        (ConcurrencyCoordinator::new(Arc::new(backend), config), id)
    }

    #[test]
    fn legal_transitions() {
        use CommitState::{Abandoned, Committed, Committing, Conflicted, Pending, Resolving};

        assert!(Pending.can_transition_to(Committing));
        assert!(Committing.can_transition_to(Committed));
        assert!(Committing.can_transition_to(Conflicted));
        assert!(Conflicted.can_transition_to(Resolving));
        assert!(Resolving.can_transition_to(Committing));
        assert!(Resolving.can_transition_to(Abandoned));

        assert!(!Pending.can_transition_to(Committed));
        assert!(!Conflicted.can_transition_to(Committing));
        assert!(!Committed.can_transition_to(Committing));
        assert!(Committed.is_terminal());
        assert!(Abandoned.is_terminal());
        assert!(!Resolving.is_terminal());
    }

    #[test]
    fn policy_retry_budgets() {
        assert_eq!(ResolutionPolicy::RetryOnce.max_retries(), 1);
        assert_eq!(ResolutionPolicy::ReportOnly.max_retries(), 0);
        assert_eq!(ResolutionPolicy::RetryUpTo(4).max_retries(), 4);
        assert_eq!(ResolutionPolicy::default(), ResolutionPolicy::RetryOnce);
    }

    #[tokio::test]
    async fn uncontended_commit_bumps_version() {
        let (coordinator, id) = coordinator_with(ResolutionPolicy::RetryOnce).await;
        let before = coordinator.backend().read(&id).await.unwrap();

        let outcome = coordinator
            .commit(&id, |fields| {
                fields.insert("count".to_owned(), FieldValue::Integer(5));
            })
            .await
            .unwrap();

        assert_eq!(outcome.rounds, 1);
        assert!(outcome.conflicts.is_empty());
        assert_ne!(outcome.record.version, before.version);
        assert_eq!(outcome.record.field("count"), Some(&FieldValue::Integer(5)));

        let stored = coordinator.backend().read(&id).await.unwrap();
        assert_eq!(stored, outcome.record);
    }

    #[tokio::test]
    async fn unchanged_mutation_writes_nothing() {
        let (coordinator, id) = coordinator_with(ResolutionPolicy::RetryOnce).await;
        let before = coordinator.backend().read(&id).await.unwrap();

        let outcome = coordinator.commit(&id, |_| {}).await.unwrap();

        assert_eq!(outcome.rounds, 0);
        assert_eq!(outcome.record, before);
        assert_eq!(coordinator.backend().read(&id).await.unwrap().version, before.version);
    }

    #[tokio::test]
    async fn commit_on_missing_record_is_not_found() {
        let (coordinator, _) = coordinator_with(ResolutionPolicy::RetryOnce).await;
        let err = coordinator
            .commit(&RecordId::new("ghost"), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.report().is_none());
    }

    #[tokio::test]
    async fn commit_or_create_creates_then_updates() {
        let (coordinator, _) = coordinator_with(ResolutionPolicy::RetryOnce).await;
        let id = RecordId::new("TEMP;fresh");

        let created = coordinator
            .commit_or_create(&id, AGGREGATE_ENTITY, |fields| {
                fields.insert("value".to_owned(), FieldValue::Float(21.5));
            })
            .await
            .unwrap();
        assert_eq!(created.rounds, 1);
        assert_eq!(created.record.entity, AGGREGATE_ENTITY);

        let updated = coordinator
            .commit_or_create(&id, AGGREGATE_ENTITY, |fields| {
                fields.insert("value".to_owned(), FieldValue::Float(23.0));
            })
            .await
            .unwrap();
        assert_ne!(updated.record.version, created.record.version);
        assert_eq!(updated.record.field("value"), Some(&FieldValue::Float(23.0)));
    }

    #[tokio::test]
    async fn sequential_commits_see_each_other() {
        let (coordinator, id) = coordinator_with(ResolutionPolicy::ReportOnly).await;

        for _ in 0..3 {
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
                .unwrap();
        }

        let stored = coordinator.backend().read(&id).await.unwrap();
        assert_eq!(stored.field("count"), Some(&FieldValue::Integer(3)));
    }
}
