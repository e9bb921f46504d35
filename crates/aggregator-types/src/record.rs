//! Versioned records and conflict reports for optimistic concurrency.
//!
//! A [`VersionedRecord`] carries an opaque [`Version`] token assigned by the
//! backend that stores it. Writers read a record, mutate a copy of its
//! fields, and ask the backend to write only if the version has not moved.
//! When it has, a [`ConflictReport`] records what the writer wanted, what
//! it originally read, and what is stored now.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::RecordId;

/// Opaque, backend-assigned version token.
///
/// Changes on every successful write. Only equality is meaningful to
/// callers; backends hand out monotonically increasing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// The version a backend assigns before any write has happened.
    pub const INITIAL: Self = Self(0);

    /// Return the raw token.
    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A single field value stored in a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean flag.
    Bool(bool),
    /// Whole number.
    Integer(i64),
    /// Floating-point number.
    Float(f64),
    /// Free text.
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value, if it is a number.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    /// Integer view of the value, if it is an integer.
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl core::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Field name to value mapping of a record.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A record as stored by a versioned-record backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    /// Record identifier.
    pub id: RecordId,
    /// Entity type tag (e.g. `aggregate`, `inventory`).
    pub entity: String,
    /// Current field values.
    pub fields: FieldMap,
    /// Version token of this snapshot.
    pub version: Version,
}

impl VersionedRecord {
    /// Look up a single field.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Names of fields whose value differs between `original` and `proposed`,
/// including fields added or removed by the writer.
pub fn touched_fields(original: &FieldMap, proposed: &FieldMap) -> BTreeSet<String> {
    original
        .keys()
        .chain(proposed.keys())
        .filter(|name| original.get(*name) != proposed.get(*name))
        .cloned()
        .collect()
}

/// Per-field view of a failed optimistic commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Field name.
    pub field: String,
    /// Value the writer tried to commit (`None` if it removed the field).
    pub proposed: Option<FieldValue>,
    /// Value the writer read before mutating.
    pub original: Option<FieldValue>,
    /// Value stored in the backend now.
    pub current: Option<FieldValue>,
}

/// Comparison of a writer's intent with the stored state after a version
/// mismatch. One report is produced per failed commit attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// The record that conflicted.
    pub record_id: RecordId,
    /// Entity type of the record.
    pub entity: String,
    /// Version the writer read and expected to still be current.
    pub expected_version: Version,
    /// Version actually stored when the write was attempted.
    pub current_version: Version,
    /// One entry per field the writer touched.
    pub fields: Vec<FieldConflict>,
}

impl ConflictReport {
    /// Build a report from the writer's original snapshot, its proposed
    /// fields, and the record currently stored.
    pub fn between(
        original: &VersionedRecord,
        proposed: &FieldMap,
        current: &VersionedRecord,
    ) -> Self {
        let fields = touched_fields(&original.fields, proposed)
            .into_iter()
            .map(|field| FieldConflict {
                proposed: proposed.get(&field).cloned(),
                original: original.fields.get(&field).cloned(),
                current: current.fields.get(&field).cloned(),
                field,
            })
            .collect();

        Self {
            record_id: original.id.clone(),
            entity: current.entity.clone(),
            expected_version: original.version,
            current_version: current.version,
            fields,
        }
    }

    /// Look up the conflict entry for a field.
    pub fn field(&self, name: &str) -> Option<&FieldConflict> {
        self.fields.iter().find(|c| c.field == name)
    }
}

impl core::fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "record {} ({}) expected {} but found {}",
            self.record_id, self.entity, self.expected_version, self.current_version
        )?;
        for c in &self.fields {
            write!(f, "; {}: proposed ", c.field)?;
            write_opt(f, c.proposed.as_ref())?;
            f.write_str(", original ")?;
            write_opt(f, c.original.as_ref())?;
            f.write_str(", current ")?;
            write_opt(f, c.current.as_ref())?;
        }
        Ok(())
    }
}

fn write_opt(f: &mut core::fmt::Formatter<'_>, value: Option<&FieldValue>) -> core::fmt::Result {
    match value {
        Some(v) => write!(f, "{v}"),
        None => f.write_str("<absent>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: u64, available: i64) -> VersionedRecord {
        let mut fields = FieldMap::new();
        fields.insert("name".to_owned(), FieldValue::from("ItemA"));
        fields.insert("available".to_owned(), FieldValue::from(available));
        VersionedRecord {
            id: RecordId::new("item-a"),
            entity: "inventory".to_owned(),
            fields,
            version: Version(version),
        }
    }

    #[test]
    fn touched_fields_covers_changes_additions_and_removals() {
        let original = record(1, 10).fields;
        let mut proposed = original.clone();
        proposed.insert("available".to_owned(), FieldValue::from(100_i64));
        proposed.insert("note".to_owned(), FieldValue::from("restock"));
        proposed.remove("name");

        let touched = touched_fields(&original, &proposed);
        let names: Vec<&str> = touched.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["available", "name", "note"]);
    }

    #[test]
    fn report_lists_proposed_original_and_current() {
        let original = record(1, 10);
        let mut proposed = original.fields.clone();
        proposed.insert("available".to_owned(), FieldValue::from(200_i64));
        let current = record(2, 100);

        let report = ConflictReport::between(&original, &proposed, &current);
        assert_eq!(report.expected_version, Version(1));
        assert_eq!(report.current_version, Version(2));
        assert_eq!(report.fields.len(), 1);

        let available = report.field("available");
        assert!(available.is_some());
        let available = available.cloned().unwrap_or(FieldConflict {
            field: String::new(),
            proposed: None,
            original: None,
            current: None,
        });
        assert_eq!(available.proposed, Some(FieldValue::Integer(200)));
        assert_eq!(available.original, Some(FieldValue::Integer(10)));
        assert_eq!(available.current, Some(FieldValue::Integer(100)));
        assert!(
            report
                .to_string()
                .contains("available: proposed 200, original 10, current 100")
        );
    }

    #[test]
    fn report_renders_missing_values_as_absent() {
        let original = record(1, 10);
        let mut proposed = original.fields.clone();
        proposed.insert("note".to_owned(), FieldValue::from("restock"));
        let current = record(2, 10);

        let rendered = ConflictReport::between(&original, &proposed, &current).to_string();
        assert!(
            rendered.contains("note: proposed \"restock\", original <absent>, current <absent>")
        );
    }

    #[test]
    fn field_values_round_trip_untagged() {
        let mut fields = FieldMap::new();
        fields.insert("count".to_owned(), FieldValue::Integer(3));
        fields.insert("value".to_owned(), FieldValue::Float(21.5));
        fields.insert("label".to_owned(), FieldValue::from("x"));
        let json = serde_json::to_value(&fields).unwrap_or_default();
        assert_eq!(json["count"], 3);
        let back: Result<FieldMap, _> = serde_json::from_value(json);
        assert_eq!(back.ok(), Some(fields));
    }
}
