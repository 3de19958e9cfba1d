//! Association between executing threads and the transactions they work on.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use gridtx_common::GlobalTransaction;

use crate::record::{CacheTransaction, LocalTransaction};

/// The originator's transaction a command is dispatched for. Participants run commands
/// through the remote handler instead.
#[derive(Debug, Clone)]
pub struct TxInvocationContext {
    tx: Arc<LocalTransaction>,
}

impl TxInvocationContext {
    pub fn new(tx: Arc<LocalTransaction>) -> Self {
        Self { tx }
    }

    pub fn global_transaction(&self) -> &GlobalTransaction {
        self.tx.global_transaction()
    }

    #[inline]
    pub fn local_transaction(&self) -> &Arc<LocalTransaction> {
        &self.tx
    }

    pub fn transaction(&self) -> &dyn CacheTransaction {
        self.tx.as_ref()
    }
}

/// Tracks which transaction each thread is currently executing.
#[derive(Debug, Default)]
pub struct InvocationContextContainer {
    associations: DashMap<ThreadId, GlobalTransaction>,
}

impl InvocationContextContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the calling thread to `gtx`.
    pub fn associate(&self, gtx: GlobalTransaction) {
        self.associations.insert(thread::current().id(), gtx);
    }

    /// The transaction bound to the calling thread.
    pub fn current(&self) -> Option<GlobalTransaction> {
        self.associations
            .get(&thread::current().id())
            .map(|gtx| gtx.clone())
    }

    /// Clears the calling thread's association, returning what it was bound to.
    pub fn suspend(&self) -> Option<GlobalTransaction> {
        self.associations
            .remove(&thread::current().id())
            .map(|(_, gtx)| gtx)
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }
}
