//! Collaborators the transaction engine is driven through.
//!
//! Routing, transport and storage live outside this crate. The engine only depends on the
//! contracts below and receives implementations at construction time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use gridtx_common::{Address, CacheTopology, EntryVersion, Key, Value};

use crate::command::{CommandResponse, TxCommand};
use crate::context::TxInvocationContext;
use crate::entry::InternalEntry;
use crate::error::{RpcError, TransactionResult};

/// The ordered chain a command traverses before it is applied.
///
/// `invoke` returns only once local processing, and any remote acknowledgment the pipeline
/// requires, has resolved.
pub trait CommandPipeline: Send + Sync {
    fn invoke(
        &self,
        ctx: &TxInvocationContext,
        command: &TxCommand,
    ) -> TransactionResult<CommandResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOptions {
    /// Wait for responses.
    pub sync: bool,
    /// Drop recipients that are not reachable instead of failing.
    pub ignore_unreachable: bool,
    pub timeout: Duration,
}

impl RpcOptions {
    pub fn sync(timeout: Duration) -> Self {
        Self {
            sync: true,
            ignore_unreachable: false,
            timeout,
        }
    }

    /// Fire and forget.
    pub fn asynchronous(timeout: Duration) -> Self {
        Self {
            sync: false,
            ignore_unreachable: true,
            timeout,
        }
    }

    pub fn with_ignore_unreachable(mut self, ignore: bool) -> Self {
        self.ignore_unreachable = ignore;
        self
    }
}

pub trait RpcTransport: Send + Sync {
    /// Address of the local node.
    fn address(&self) -> &Address;

    /// Current cluster members, the local node included.
    fn members(&self) -> Vec<Address>;

    /// Sends `command` to `recipients`, or to every other member when `None`.
    fn invoke_remotely(
        &self,
        recipients: Option<&[Address]>,
        command: &TxCommand,
        options: &RpcOptions,
    ) -> Result<HashMap<Address, CommandResponse>, RpcError>;
}

/// Maps keys to the members owning them.
pub trait OwnershipOracle: Send + Sync {
    fn current_topology(&self) -> Arc<CacheTopology>;

    /// Owners of `keys` under `topology`. `None` stands for every member.
    fn owners(&self, topology: &CacheTopology, keys: &HashSet<Key>) -> Option<HashSet<Address>>;

    /// Whether `address` owns `key` under the current topology.
    fn is_owner(&self, address: &Address, key: &Key) -> bool {
        let topology = self.current_topology();
        let keys = HashSet::from([key.clone()]);
        match self.owners(&topology, &keys) {
            Some(owners) => owners.contains(address),
            None => true,
        }
    }
}

/// The key/value storage engine.
pub trait DataContainer: Send + Sync {
    fn get(&self, key: &Key) -> Option<InternalEntry>;

    fn put(&self, key: Key, value: Value, version: EntryVersion);

    fn remove(&self, key: &Key);
}
