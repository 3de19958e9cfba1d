//! Cluster-unique transaction identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::IdError;

/// Identifies one distributed transaction across the whole cluster.
///
/// It is the pair of the originating node and a sequence number that is unique on that node, so
/// two nodes can allocate ids without coordinating. The identifier is the registry key and the
/// correlation id of every command sent on behalf of the transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalTransaction {
    address: Address,
    id: u64,
}

impl GlobalTransaction {
    pub fn new(address: Address, id: u64) -> Self {
        Self { address, id }
    }

    /// The node that originated the transaction.
    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The sequence number allocated by the originator.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTx:{}:{}", self.address, self.id)
    }
}

/// Allocates monotonically increasing transaction sequence numbers for one node.
pub struct TransactionIdGenerator {
    counter: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self::with_start(1)
    }

    pub fn with_start(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Generate the next sequence number.
    pub fn next(&self) -> Result<u64, IdError> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(IdError::TxnIdOverflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Allocate a new identifier for a transaction originating at `address`.
    pub fn new_global_transaction(&self, address: Address) -> Result<GlobalTransaction, IdError> {
        Ok(GlobalTransaction::new(address, self.next()?))
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
