//! `PostgreSQL` versioned-record backend.
//!
//! Records live in the `versioned_records` table. The `version` column is
//! filled from `record_version_seq` on insert and on every successful
//! update, standing in for a row-modification counter. The conditional
//! write is one `UPDATE ... WHERE id = $1 AND version = $2` statement, so
//! the compare and the swap happen atomically inside the database.
//!
//! Uses runtime query construction (not compile-time checked) so builds do
//! not need a live database.

use aggregator_types::{FieldMap, RecordId, Version, VersionedRecord};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::error::StoreError;
use crate::record_backend::{RecordBackend, WriteOutcome};

/// A row from the `versioned_records` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecordRow {
    /// Record identifier.
    pub id: String,
    /// Entity type tag.
    pub entity: String,
    /// Field values as JSON.
    pub fields: Json<FieldMap>,
    /// Version token.
    pub version: i64,
    /// Time of the last successful write.
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for VersionedRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: RecordId(row.id),
            entity: row.entity,
            fields: row.fields.0,
            version: version_from_db(row.version)?,
        })
    }
}

/// Versioned-record backend over a shared `PostgreSQL` pool.
#[derive(Debug, Clone)]
pub struct PgRecordBackend {
    pool: PgPool,
}

impl PgRecordBackend {
    /// Create a backend bound to a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &RecordId) -> Result<Option<VersionedRecord>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r"SELECT id, entity, fields, version, updated_at
              FROM versioned_records
              WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(VersionedRecord::try_from).transpose()
    }
}

impl RecordBackend for PgRecordBackend {
    async fn read(&self, id: &RecordId) -> Result<VersionedRecord, StoreError> {
        self.fetch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn conditional_write(
        &self,
        id: &RecordId,
        expected: Version,
        fields: &FieldMap,
    ) -> Result<WriteOutcome, StoreError> {
        let committed: Option<i64> = sqlx::query_scalar(
            r"UPDATE versioned_records
              SET fields = $3, version = nextval('record_version_seq'), updated_at = now()
              WHERE id = $1 AND version = $2
              RETURNING version",
        )
        .bind(id.as_str())
        .bind(version_to_db(expected)?)
        .bind(Json(fields))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = committed {
            let version = version_from_db(version)?;
            tracing::debug!(record_id = %id, %version, "PostgreSQL conditional write committed");
            return Ok(WriteOutcome::Committed(version));
        }

        // Zero rows updated: either the row is gone or its version moved.
        let current = self.read(id).await?;
        Ok(WriteOutcome::VersionMismatch(current))
    }

    async fn create(
        &self,
        id: &RecordId,
        entity: &str,
        fields: &FieldMap,
    ) -> Result<Version, StoreError> {
        let created: Option<i64> = sqlx::query_scalar(
            r"INSERT INTO versioned_records (id, entity, fields)
              VALUES ($1, $2, $3)
              ON CONFLICT (id) DO NOTHING
              RETURNING version",
        )
        .bind(id.as_str())
        .bind(entity)
        .bind(Json(fields))
        .fetch_optional(&self.pool)
        .await?;

        created.map_or_else(
            || Err(StoreError::AlreadyExists(id.to_string())),
            version_from_db,
        )
    }
}

fn version_from_db(raw: i64) -> Result<Version, StoreError> {
    u64::try_from(raw)
        .map(Version)
        .map_err(|e| StoreError::Corrupt(format!("negative version {raw}: {e}")))
}

fn version_to_db(version: Version) -> Result<i64, StoreError> {
    i64::try_from(version.into_inner())
        .map_err(|e| StoreError::Corrupt(format!("version {version} out of range: {e}")))
}
