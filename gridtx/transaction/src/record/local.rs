use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use gridtx_common::{Address, GlobalTransaction, TopologyId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{CacheTransaction, TxCore};

/// Handle of the platform transaction a [`LocalTransaction`] was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionHandle(u64);

impl TransactionHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// A transaction originated by this node.
#[derive(Debug)]
pub struct LocalTransaction {
    core: TxCore,
    handle: TransactionHandle,
    /// Started by a single non-transactional operation rather than by the caller.
    implicit: bool,
    marked_for_rollback: AtomicBool,
    remote_locked_nodes: RwLock<HashSet<Address>>,
}

impl LocalTransaction {
    pub fn new(
        handle: TransactionHandle,
        gtx: GlobalTransaction,
        topology_id: TopologyId,
        implicit: bool,
    ) -> Self {
        Self {
            core: TxCore::new(gtx, topology_id),
            handle,
            implicit,
            marked_for_rollback: AtomicBool::new(false),
            remote_locked_nodes: RwLock::new(HashSet::new()),
        }
    }

    #[inline]
    pub fn handle(&self) -> TransactionHandle {
        self.handle
    }

    #[inline]
    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// Flags the transaction so the coordinator refuses to make further progress. Safe to call
    /// from any thread. Returns `true` for the call that set the flag.
    pub fn mark_for_rollback(&self) -> bool {
        !self.marked_for_rollback.swap(true, Ordering::AcqRel)
    }

    /// Records that the transaction holds locks on `nodes`.
    pub fn locks_acquired<'a>(&self, nodes: impl IntoIterator<Item = &'a Address>) {
        let mut locked = self.remote_locked_nodes.write();
        locked.extend(nodes.into_iter().cloned());
    }

    pub fn remote_locked_nodes(&self) -> HashSet<Address> {
        self.remote_locked_nodes.read().clone()
    }

    /// Whether any node in `leavers` holds a lock for this transaction.
    pub fn has_remote_locks_acquired(&self, leavers: &HashSet<Address>) -> bool {
        self.remote_locked_nodes
            .read()
            .iter()
            .any(|node| leavers.contains(node))
    }

    /// The subset of `leavers` holding a lock for this transaction.
    pub fn filter_remote_locks_acquired(&self, leavers: &HashSet<Address>) -> Vec<Address> {
        self.remote_locked_nodes
            .read()
            .iter()
            .filter(|node| leavers.contains(*node))
            .cloned()
            .collect()
    }
}

impl CacheTransaction for LocalTransaction {
    #[inline]
    fn core(&self) -> &TxCore {
        &self.core
    }

    #[inline]
    fn is_marked_for_rollback(&self) -> bool {
        self.marked_for_rollback.load(Ordering::Acquire)
    }
}
