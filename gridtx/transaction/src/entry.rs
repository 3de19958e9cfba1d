//! Per-transaction entry snapshots.

use gridtx_common::{EntryVersion, Key, Value, VersionGenerator, VersionOrdering};
use serde::{Deserialize, Serialize};

use crate::spi::DataContainer;

/// A stored entry as reported by the [`DataContainer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalEntry {
    pub value: Value,
    pub version: EntryVersion,
}

impl InternalEntry {
    pub fn new(value: Value, version: EntryVersion) -> Self {
        Self { value, version }
    }
}

/// An entry as seen by one transaction: the version it read plus any write applied on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccEntry {
    key: Key,
    value: Option<Value>,
    /// Version observed when the entry was read, `None` if the key did not exist.
    version: Option<EntryVersion>,
    created: bool,
    removed: bool,
    changed: bool,
}

impl MvccEntry {
    /// Wraps what the container returned for `key`.
    pub fn read(key: Key, stored: Option<InternalEntry>) -> Self {
        match stored {
            Some(entry) => Self {
                key,
                value: Some(entry.value),
                version: Some(entry.version),
                created: false,
                removed: false,
                changed: false,
            },
            None => Self {
                key,
                value: None,
                version: None,
                created: false,
                removed: false,
                changed: false,
            },
        }
    }

    #[inline]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    #[inline]
    pub fn version(&self) -> Option<&EntryVersion> {
        self.version.as_ref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn set_value(&mut self, value: Value) {
        if self.value.is_none() {
            self.created = true;
        }
        self.value = Some(value);
        self.removed = false;
        self.changed = true;
    }

    pub fn set_removed(&mut self) {
        self.value = None;
        self.removed = true;
        self.changed = true;
    }

    /// Validates that the stored entry still carries the version this transaction read.
    ///
    /// `version_seen` is the read-set lookup for the key: `Some(None)` means the key was read
    /// while absent and only validates against the generator's non-existing version. `None`
    /// marks a blind write, which falls back to the version recorded on the entry itself.
    pub fn perform_write_skew_check(
        &self,
        container: &dyn DataContainer,
        version_seen: Option<Option<&EntryVersion>>,
        generator: &dyn VersionGenerator,
    ) -> bool {
        let non_existing = generator.non_existing();
        let seen = match version_seen {
            Some(seen) => seen,
            None => self.version.as_ref(),
        };
        let seen = seen.unwrap_or(&non_existing);
        let live = container.get(&self.key).map(|entry| entry.version);
        let live = live.as_ref().unwrap_or(&non_existing);
        live.compare_to(seen) == VersionOrdering::Equal
    }

    /// Writes the entry through to the container under `version`.
    pub fn commit(&self, container: &dyn DataContainer, version: EntryVersion) {
        if !self.changed {
            return;
        }
        match &self.value {
            Some(value) if !self.removed => container.put(self.key.clone(), value.clone(), version),
            _ => container.remove(&self.key),
        }
    }
}
