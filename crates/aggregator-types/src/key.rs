//! Composite key for aggregate entries.
//!
//! An [`AggregateKey`] pairs a category (the device type) with an entity ID
//! (the device). It renders as `{category};{entity_id}`, which is also the
//! form prefix queries match against, so `"TEMP;"` selects every
//! temperature device.

use serde::{Deserialize, Serialize};

/// Separator between the category and entity parts of a rendered key.
pub const KEY_SEPARATOR: char = ';';

/// Identifies one logical aggregate.
///
/// Ordering is by category, then entity ID, which gives deterministic
/// iteration over a store snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AggregateKey {
    category: String,
    entity_id: String,
}

impl AggregateKey {
    /// Build a key from its two parts.
    pub fn new(category: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            entity_id: entity_id.into(),
        }
    }

    /// The category part (e.g. `TEMP`).
    pub fn category(&self) -> &str {
        &self.category
    }

    /// The entity part (e.g. a device UUID).
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Prefix that matches every key in `category`.
    pub fn category_prefix(category: &str) -> String {
        format!("{category}{KEY_SEPARATOR}")
    }

    /// Whether the rendered form of this key starts with `prefix`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        prefix.strip_prefix(self.category.as_str()).map_or_else(
            || self.category.starts_with(prefix),
            |rest| {
                rest.is_empty()
                    || rest
                        .strip_prefix(KEY_SEPARATOR)
                        .is_some_and(|entity_prefix| self.entity_id.starts_with(entity_prefix))
            },
        )
    }
}

impl core::fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.category, self.entity_id)
    }
}

/// Error returned when a rendered key has no separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyError(String);

impl core::fmt::Display for ParseKeyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "aggregate key `{}` has no `{KEY_SEPARATOR}` separator", self.0)
    }
}

impl std::error::Error for ParseKeyError {}

impl core::str::FromStr for AggregateKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_once(KEY_SEPARATOR)
            .map(|(category, entity_id)| Self::new(category, entity_id))
            .ok_or_else(|| ParseKeyError(s.to_owned()))
    }
}

impl TryFrom<String> for AggregateKey {
    type Error = ParseKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AggregateKey> for String {
    fn from(key: AggregateKey) -> Self {
        key.to_string()
    }
}
