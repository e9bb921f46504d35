//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Devices and readings are addressed by UUIDs on the wire. Wrapping them
//! prevents a reading ID from being passed where a device ID is expected.
//! Versioned records use a free-form string [`RecordId`] because their IDs
//! are chosen by whichever backend or caller owns the record.
//!
//! Parsing accepts only RFC 4122 UUIDs of versions 1 through 5; the nil
//! UUID and the newer layouts are rejected.

use serde::{Deserialize, Serialize};
use uuid::{Uuid, Variant};

use crate::key::AggregateKey;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier (UUID v4).
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl core::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_wire_uuid(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

/// Why a string was not accepted as a device or reading ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    /// Not a UUID at all.
    Malformed(uuid::Error),
    /// A UUID, but not an RFC 4122 version 1-5 one.
    UnsupportedVersion(usize),
}

impl core::fmt::Display for IdParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed UUID: {e}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported UUID version {v}"),
        }
    }
}

impl std::error::Error for IdParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            Self::UnsupportedVersion(_) => None,
        }
    }
}

fn parse_wire_uuid(s: &str) -> Result<Uuid, IdParseError> {
    let id = Uuid::parse_str(s).map_err(IdParseError::Malformed)?;
    let version = id.get_version_num();
    if id.get_variant() != Variant::RFC4122 || !(1..=5).contains(&version) {
        return Err(IdParseError::UnsupportedVersion(version));
    }
    Ok(id)
}

define_id! {
    /// Unique identifier for a reporting device.
    DeviceId
}

define_id! {
    /// Unique identifier for a single data point produced by a device.
    ReadingId
}

/// Identifier of a record held by a versioned-record backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Wrap an arbitrary string as a record identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&AggregateKey> for RecordId {
    fn from(key: &AggregateKey) -> Self {
        Self(key.to_string())
    }
}

impl From<Uuid> for RecordId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}
