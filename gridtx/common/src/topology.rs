use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::address::Address;

pub type TopologyId = u32;

/// Snapshot of the cluster membership as seen by the local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTopology {
    topology_id: TopologyId,
    members: Vec<Address>,
}

impl CacheTopology {
    pub fn new(topology_id: TopologyId, members: Vec<Address>) -> Self {
        Self {
            topology_id,
            members,
        }
    }

    #[inline]
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    #[inline]
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }
}

/// Delivered by the membership layer whenever the topology is replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyChangedEvent {
    old: CacheTopology,
    new: CacheTopology,
}

impl TopologyChangedEvent {
    pub fn new(old: CacheTopology, new: CacheTopology) -> Self {
        Self { old, new }
    }

    pub fn old_topology(&self) -> &CacheTopology {
        &self.old
    }

    pub fn new_topology(&self) -> &CacheTopology {
        &self.new
    }

    /// Members present in the old view but absent from the new one.
    pub fn leavers(&self) -> HashSet<Address> {
        self.old
            .members
            .iter()
            .filter(|member| !self.new.contains(member))
            .cloned()
            .collect()
    }
}
