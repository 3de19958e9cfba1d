//! Per-key entry versions used by the optimistic write-skew check.
//!
//! A version is a logical clock for one key, never wall time. Versions minted in a later topology
//! always order after versions minted in an earlier one, so ownership changes cannot make an old
//! version look current.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::collections::hash_map;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::IdError;
use crate::key::Key;
use crate::topology::TopologyId;

/// Result of comparing two entry versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    Before,
    Equal,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryVersion {
    topology_id: TopologyId,
    version: u64,
}

impl EntryVersion {
    pub const fn new(topology_id: TopologyId, version: u64) -> Self {
        Self {
            topology_id,
            version,
        }
    }

    #[inline]
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Compares `self` against `other`, topology first and counter second.
    pub fn compare_to(&self, other: &EntryVersion) -> VersionOrdering {
        match self
            .topology_id
            .cmp(&other.topology_id)
            .then(self.version.cmp(&other.version))
        {
            CmpOrdering::Less => VersionOrdering::Before,
            CmpOrdering::Equal => VersionOrdering::Equal,
            CmpOrdering::Greater => VersionOrdering::After,
        }
    }
}

/// Mints entry versions for the write-skew check.
pub trait VersionGenerator: Send + Sync {
    /// Version assigned to an entry created by the committing transaction.
    fn generate_new(&self) -> EntryVersion;

    /// Version following `version`.
    fn increment(&self, version: &EntryVersion) -> Result<EntryVersion, IdError>;

    /// Version that stands for "no entry stored".
    fn non_existing(&self) -> EntryVersion;
}

/// Counter based generator stamping versions with the current topology id.
#[derive(Debug, Default)]
pub struct NumericVersionGenerator {
    topology_id: AtomicU32,
}

impl NumericVersionGenerator {
    pub fn new(topology_id: TopologyId) -> Self {
        Self {
            topology_id: AtomicU32::new(topology_id),
        }
    }

    /// Update the topology id stamped on newly generated versions.
    pub fn set_topology_id(&self, topology_id: TopologyId) {
        self.topology_id.fetch_max(topology_id, Ordering::SeqCst);
    }
}

impl VersionGenerator for NumericVersionGenerator {
    fn generate_new(&self) -> EntryVersion {
        EntryVersion::new(self.topology_id.load(Ordering::SeqCst), 1)
    }

    fn increment(&self, version: &EntryVersion) -> Result<EntryVersion, IdError> {
        let next = version
            .version
            .checked_add(1)
            .ok_or(IdError::VersionOverflow(version.version))?;
        let topology_id = self
            .topology_id
            .load(Ordering::SeqCst)
            .max(version.topology_id);
        Ok(EntryVersion::new(topology_id, next))
    }

    fn non_existing(&self) -> EntryVersion {
        EntryVersion::new(0, 0)
    }
}

/// Key to new-version mapping produced by the write-skew validator.
///
/// Under total-order delivery keys map to `None`: the key was validated but no version was
/// computed for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVersionsMap {
    versions: HashMap<Key, Option<EntryVersion>>,
}

impl EntryVersionsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Key, version: Option<EntryVersion>) {
        self.versions.insert(key, version);
    }

    /// The computed version for `key`, if there is one.
    pub fn get(&self, key: &Key) -> Option<&EntryVersion> {
        self.versions.get(key).and_then(Option::as_ref)
    }

    /// The raw mapping for `key`: `Some(None)` when the key was read while absent or validated
    /// without a version.
    pub fn lookup(&self, key: &Key) -> Option<Option<&EntryVersion>> {
        self.versions.get(key).map(Option::as_ref)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.versions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.versions.keys()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, Key, Option<EntryVersion>> {
        self.versions.iter()
    }

    /// Merges `other` into `self`. For every key present in `other` its value replaces ours:
    /// the side that computed a key's version is the one asserting it.
    pub fn merge(&mut self, other: &EntryVersionsMap) {
        for (key, version) in &other.versions {
            self.versions.insert(key.clone(), *version);
        }
    }
}

impl FromIterator<(Key, Option<EntryVersion>)> for EntryVersionsMap {
    fn from_iter<T: IntoIterator<Item = (Key, Option<EntryVersion>)>>(iter: T) -> Self {
        Self {
            versions: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for EntryVersionsMap {
    type IntoIter = hash_map::IntoIter<Key, Option<EntryVersion>>;
    type Item = (Key, Option<EntryVersion>);

    fn into_iter(self) -> Self::IntoIter {
        self.versions.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_orders_topology_before_counter() {
        let old = EntryVersion::new(1, 10);
        let new = EntryVersion::new(2, 1);
        assert_eq!(old.compare_to(&new), VersionOrdering::Before);
        assert_eq!(new.compare_to(&old), VersionOrdering::After);
        assert_eq!(old.compare_to(&EntryVersion::new(1, 10)), VersionOrdering::Equal);
    }

    #[test]
    fn test_numeric_generator() {
        let generator = NumericVersionGenerator::new(3);
        assert_eq!(generator.generate_new(), EntryVersion::new(3, 1));
        assert_eq!(
            generator.increment(&EntryVersion::new(3, 1)).unwrap(),
            EntryVersion::new(3, 2)
        );

        // Topology ids never move backwards.
        generator.set_topology_id(5);
        generator.set_topology_id(4);
        assert_eq!(
            generator.increment(&EntryVersion::new(3, 7)).unwrap(),
            EntryVersion::new(5, 8)
        );
        assert!(
            generator
                .increment(&EntryVersion::new(3, u64::MAX))
                .is_err()
        );
    }

    #[test]
    fn test_merge_is_last_writer_wins_per_key() {
        let mut coordinator: EntryVersionsMap = [
            (Key::from("a"), Some(EntryVersion::new(1, 1))),
            (Key::from("b"), Some(EntryVersion::new(1, 4))),
        ]
        .into_iter()
        .collect();
        let participant: EntryVersionsMap = [
            (Key::from("b"), Some(EntryVersion::new(1, 5))),
            (Key::from("c"), None),
        ]
        .into_iter()
        .collect();

        coordinator.merge(&participant);
        assert_eq!(coordinator.len(), 3);
        assert_eq!(coordinator.get(&Key::from("a")), Some(&EntryVersion::new(1, 1)));
        assert_eq!(coordinator.get(&Key::from("b")), Some(&EntryVersion::new(1, 5)));
        assert!(coordinator.contains_key(&Key::from("c")));
        assert_eq!(coordinator.get(&Key::from("c")), None);
    }
}
