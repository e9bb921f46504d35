//! Shared type definitions for the device aggregator.
//!
//! Every crate in the workspace speaks in these types: the store keys its
//! entries by [`AggregateKey`], the coordinator moves [`VersionedRecord`]s
//! and [`ConflictReport`]s around, and all errors map to an [`ErrorKind`].
//!
//! # Modules
//!
//! - [`ids`] -- UUID wrappers for devices and readings, string record IDs
//! - [`key`] -- Composite aggregate key and prefix matching
//! - [`record`] -- Versioned records, field values, conflict reports
//! - [`reading`] -- Device readings submitted for aggregation
//! - [`error_kind`] -- Stable error codes

pub mod error_kind;
pub mod ids;
pub mod key;
pub mod reading;
pub mod record;

// Re-export all public types at crate root for convenience.
pub use error_kind::ErrorKind;
pub use ids::{DeviceId, IdParseError, ReadingId, RecordId};
pub use key::{AggregateKey, KEY_SEPARATOR, ParseKeyError};
pub use reading::Reading;
pub use record::{
    ConflictReport, FieldConflict, FieldMap, FieldValue, Version, VersionedRecord, touched_fields,
};
