//! In-process aggregate store.
//!
//! Maps an [`AggregateKey`] to a single scalar value. Both the aggregator
//! (one running value per device) and the local historian (one raw value
//! per reading) use it.
//!
//! Every call takes the lock exactly once, so a snapshot or an average is
//! always computed over a point-in-time view of the map; no reader ever
//! sees an entry mid-update.
//!
//! `update` overwrites. [`AggregateStore::average_by_prefix`] averages the
//! values currently stored; it does not keep a running mean across
//! updates.
//!
//! Entries mirrored from a shared versioned record go through
//! [`AggregateStore::apply_versioned`], which only moves an entry forward:
//! a value committed at an older version never replaces a newer one.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use aggregator_types::{AggregateKey, Version};

use crate::error::StoreError;

/// Concurrency-safe mapping from aggregate key to value.
#[derive(Debug, Default)]
pub struct AggregateStore {
    entries: RwLock<BTreeMap<AggregateKey, Slot>>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: f64,
    /// Version of the shared record this value came from, if any.
    version: Option<Version>,
}

impl Slot {
    const fn local(value: f64) -> Self {
        Self {
            value,
            version: None,
        }
    }
}

impl AggregateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if `key` is present; the stored
    /// value is left untouched.
    pub fn add(&self, key: AggregateKey, value: f64) -> Result<(), StoreError> {
        let mut entries = self.write();
        if entries.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        entries.insert(key, Slot::local(value));
        Ok(())
    }

    /// Overwrite an existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `key` is absent.
    pub fn update(&self, key: &AggregateKey, value: f64) -> Result<(), StoreError> {
        let mut entries = self.write();
        let slot = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        *slot = Slot::local(value);
        Ok(())
    }

    /// Store `value` for `key` as committed at `version`, unless the entry
    /// already holds a value from the same or a later version.
    ///
    /// Returns whether the entry changed. Entries written through
    /// [`add`](Self::add) or [`update`](Self::update) carry no version and
    /// are always replaced.
    pub fn apply_versioned(&self, key: &AggregateKey, value: f64, version: Version) -> bool {
        let mut entries = self.write();
        let incoming = Slot {
            value,
            version: Some(version),
        };
        match entries.get_mut(key) {
            Some(slot) if slot.version.is_some_and(|stored| stored >= version) => false,
            Some(slot) => {
                *slot = incoming;
                true
            }
            None => {
                entries.insert(key.clone(), incoming);
                true
            }
        }
    }

    /// Version recorded alongside `key`, if it was written by
    /// [`apply_versioned`](Self::apply_versioned).
    pub fn version_of(&self, key: &AggregateKey) -> Option<Version> {
        self.read().get(key).and_then(|slot| slot.version)
    }

    /// Whether an entry exists for `key`.
    pub fn exists(&self, key: &AggregateKey) -> bool {
        self.read().contains_key(key)
    }

    /// Read the value stored for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `key` is absent.
    pub fn get(&self, key: &AggregateKey) -> Result<f64, StoreError> {
        self.read()
            .get(key)
            .map(|slot| slot.value)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// Copy of every entry, ordered by key.
    pub fn get_all(&self) -> BTreeMap<AggregateKey, f64> {
        self.read()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.value))
            .collect()
    }

    /// Arithmetic mean of every entry whose rendered key starts with
    /// `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoMatchingEntries`] if nothing matches.
    pub fn average_by_prefix(&self, prefix: &str) -> Result<f64, StoreError> {
        let entries = self.read();
        let (sum, count) = entries
            .iter()
            .filter(|(key, _)| key.matches_prefix(prefix))
            .fold((0.0_f64, 0_u32), |(sum, count), (_, slot)| {
                (sum + slot.value, count.saturating_add(1))
            });
        drop(entries);

        if count == 0 {
            return Err(StoreError::NoMatchingEntries(prefix.to_owned()));
        }
        Ok(sum / f64::from(count))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panic while holding the guard cannot leave the map half-written:
    // every mutation is a single insert or assignment.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<AggregateKey, Slot>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<AggregateKey, Slot>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
