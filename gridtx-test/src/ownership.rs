use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use gridtx_common::{Address, CacheTopology, Key};
use gridtx_transaction::OwnershipOracle;
use parking_lot::RwLock;

/// Ownership assigned key by key. Keys without an assignment are owned by every member.
#[derive(Debug)]
pub struct StaticOwnership {
    topology: RwLock<Arc<CacheTopology>>,
    assignments: DashMap<Key, Vec<Address>>,
}

impl StaticOwnership {
    pub fn new(topology: CacheTopology) -> Self {
        Self {
            topology: RwLock::new(Arc::new(topology)),
            assignments: DashMap::new(),
        }
    }

    pub fn assign(&self, key: Key, owners: Vec<Address>) {
        self.assignments.insert(key, owners);
    }

    /// Installs `topology` and returns the one it replaced.
    pub fn set_topology(&self, topology: CacheTopology) -> Arc<CacheTopology> {
        std::mem::replace(&mut *self.topology.write(), Arc::new(topology))
    }

    /// Owners of `key` in the current topology, sorted.
    pub fn owners_of(&self, key: &Key) -> Vec<Address> {
        let topology = self.current_topology();
        let mut owners: Vec<Address> = match self.owners(&topology, &HashSet::from([key.clone()])) {
            Some(owners) => owners.into_iter().collect(),
            None => topology.members().to_vec(),
        };
        owners.sort();
        owners
    }
}

impl OwnershipOracle for StaticOwnership {
    fn current_topology(&self) -> Arc<CacheTopology> {
        self.topology.read().clone()
    }

    fn owners(&self, topology: &CacheTopology, keys: &HashSet<Key>) -> Option<HashSet<Address>> {
        let mut owners = HashSet::new();
        for key in keys {
            let assigned = self.assignments.get(key)?;
            owners.extend(
                assigned
                    .iter()
                    .filter(|owner| topology.contains(owner))
                    .cloned(),
            );
        }
        Some(owners)
    }
}
