//! One-shot gates that let a transaction wait for an earlier, conflicting one to finish.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gridtx_common::{GlobalTransaction, Key};
use parking_lot::{Condvar, Mutex};

use crate::error::{TransactionError, TransactionResult};

/// What [`TxDependencyLatch::await_release`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchWait {
    Released,
    TimedOut,
}

/// Released once, when the named transaction commits or rolls back.
#[derive(Debug)]
pub struct TxDependencyLatch {
    gtx: GlobalTransaction,
    released: Mutex<bool>,
    cond: Condvar,
}

impl TxDependencyLatch {
    pub fn new(gtx: GlobalTransaction) -> Self {
        Self {
            gtx,
            released: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// The transaction this latch waits for.
    pub fn global_transaction(&self) -> &GlobalTransaction {
        &self.gtx
    }

    /// Opens the latch and wakes every waiter. Returns `true` only for the call that
    /// actually opened it.
    pub fn release(&self) -> bool {
        let mut released = self.released.lock();
        if *released {
            return false;
        }
        *released = true;
        self.cond.notify_all();
        true
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }

    /// Blocks until the latch is released or `timeout` elapses.
    pub fn await_release(&self, timeout: Duration) -> LatchWait {
        let deadline = Instant::now() + timeout;
        let mut released = self.released.lock();
        while !*released {
            if self.cond.wait_until(&mut released, deadline).timed_out() {
                return if *released {
                    LatchWait::Released
                } else {
                    LatchWait::TimedOut
                };
            }
        }
        LatchWait::Released
    }
}

/// Remembers, per key, the latch of the last transaction that wrote it.
#[derive(Debug, Default)]
pub struct KeyDependencyTracker {
    keys_locked: DashMap<Key, Arc<TxDependencyLatch>>,
    /// Serializes [`KeyDependencyTracker::register`], a transaction only ever waits on
    /// transactions registered before it.
    registration: Mutex<()>,
}

impl KeyDependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `latch` the last writer of `keys` and returns the latches of earlier writers that
    /// have not finished yet.
    pub fn register<'a>(
        &self,
        latch: &Arc<TxDependencyLatch>,
        keys: impl IntoIterator<Item = &'a Key>,
    ) -> Vec<Arc<TxDependencyLatch>> {
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        let _registration = self.registration.lock();
        for key in keys {
            if let Some(previous) = self.keys_locked.insert(key.clone(), Arc::clone(latch)) {
                if Arc::ptr_eq(&previous, latch) || previous.is_released() {
                    continue;
                }
                if seen.insert(previous.global_transaction().clone()) {
                    pending.push(previous);
                }
            }
        }
        pending
    }

    /// Forgets `keys` that still point at `latch`.
    pub fn release<'a>(&self, latch: &Arc<TxDependencyLatch>, keys: impl IntoIterator<Item = &'a Key>) {
        for key in keys {
            self.keys_locked
                .remove_if(key, |_, current| Arc::ptr_eq(current, latch));
        }
    }

    /// Waits for every latch in `pending`, failing on the first one that is not released
    /// within `timeout`.
    pub fn await_all(
        &self,
        waiter: &GlobalTransaction,
        pending: &[Arc<TxDependencyLatch>],
        timeout: Duration,
    ) -> TransactionResult<()> {
        let deadline = Instant::now() + timeout;
        for latch in pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if latch.await_release(remaining) == LatchWait::TimedOut {
                return Err(TransactionError::Timeout {
                    gtx: waiter.clone(),
                    timeout,
                    waiting_for: "an earlier transaction on the same keys",
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys_locked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys_locked.is_empty()
    }
}
