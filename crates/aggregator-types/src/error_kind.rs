//! Stable, machine-readable error codes.
//!
//! Every error surfaced by the workspace maps to one [`ErrorKind`]. The
//! string form is part of the external contract (it is the `code` field of
//! API error bodies) and must not change once published.

use serde::{Deserialize, Serialize};

/// Classification of externally visible failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed caller input.
    ValidationError,
    /// The device type is not in the supported set.
    UnsupportedDeviceType,
    /// The upstream kept failing with recoverable errors until the retry
    /// budget ran out.
    TransientUpstreamError,
    /// The upstream rejected the request outright.
    FatalUpstreamError,
    /// The upstream answered but produced no value.
    NoAggregateProduced,
    /// An optimistic-concurrency conflict could not be resolved.
    VersionConflict,
    /// A conflict involved an entity type the resolver does not handle.
    UnsupportedEntity,
    /// The addressed entry or record does not exist.
    NotFound,
    /// An entry or record with the same key already exists.
    AlreadyExists,
    /// An aggregation query matched nothing.
    NoMatchingEntries,
    /// Infrastructure failure not meant for caller branching.
    Internal,
}

impl ErrorKind {
    /// The stable code string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::UnsupportedDeviceType => "unsupported_device_type",
            Self::TransientUpstreamError => "transient_upstream_error",
            Self::FatalUpstreamError => "fatal_upstream_error",
            Self::NoAggregateProduced => "no_aggregate_produced",
            Self::VersionConflict => "version_conflict",
            Self::UnsupportedEntity => "unsupported_entity",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::NoMatchingEntries => "no_matching_entries",
            Self::Internal => "internal",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_form_matches_code_string() {
        for kind in [
            ErrorKind::ValidationError,
            ErrorKind::TransientUpstreamError,
            ErrorKind::VersionConflict,
            ErrorKind::NoMatchingEntries,
        ] {
            let json = serde_json::to_string(&kind).unwrap_or_default();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
