use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use gridtx_common::{GlobalTransaction, Key, TopologyId};

use super::{CacheTransaction, TotalOrderState, TxCore};
use crate::command::WriteCommand;
use crate::entry::MvccEntry;
use crate::error::{TransactionError, TransactionResult};

/// A transaction this node participates in on behalf of another member.
#[derive(Debug)]
pub struct RemoteTransaction {
    core: TxCore,
    marked_for_rollback: AtomicBool,
    /// Rebuilt by state transfer: prepare must run again to repopulate the entries.
    missing_looked_up_entries: AtomicBool,
    /// Accept a prepare even if the transaction is already recorded as completed.
    skip_completed_check: AtomicBool,
    total_order: OnceLock<TotalOrderState>,
}

impl RemoteTransaction {
    pub fn new(gtx: GlobalTransaction, topology_id: TopologyId) -> Self {
        Self::with_modifications(gtx, topology_id, Vec::new())
    }

    pub fn with_modifications(
        gtx: GlobalTransaction,
        topology_id: TopologyId,
        modifications: Vec<WriteCommand>,
    ) -> Self {
        Self {
            core: TxCore::with_modifications(gtx, topology_id, modifications),
            marked_for_rollback: AtomicBool::new(false),
            missing_looked_up_entries: AtomicBool::new(false),
            skip_completed_check: AtomicBool::new(false),
            total_order: OnceLock::new(),
        }
    }

    /// Rolls the record back: every later entry write fails.
    pub fn mark_for_rollback(&self) {
        let _entries = self.core.looked_up_entries.write();
        self.marked_for_rollback.store(true, Ordering::Release);
    }

    pub fn is_missing_looked_up_entries(&self) -> bool {
        self.missing_looked_up_entries.load(Ordering::Acquire)
    }

    pub fn set_missing_looked_up_entries(&self, missing: bool) {
        self.missing_looked_up_entries
            .store(missing, Ordering::Release);
    }

    pub fn skip_completed_check(&self) -> bool {
        self.skip_completed_check.load(Ordering::Acquire)
    }

    pub fn set_skip_completed_check(&self, skip: bool) {
        self.skip_completed_check.store(skip, Ordering::Release);
    }

    /// Ordering state used under total-order delivery, created on first use.
    pub fn total_order_state(&self) -> &TotalOrderState {
        self.total_order.get_or_init(TotalOrderState::new)
    }
}

impl CacheTransaction for RemoteTransaction {
    #[inline]
    fn core(&self) -> &TxCore {
        &self.core
    }

    #[inline]
    fn is_marked_for_rollback(&self) -> bool {
        self.marked_for_rollback.load(Ordering::Acquire)
    }

    fn put_looked_up_entry(&self, key: Key, entry: MvccEntry) -> TransactionResult<()> {
        let mut entries = self.core.looked_up_entries.write();
        if self.is_marked_for_rollback() {
            return Err(TransactionError::InvalidTransaction(
                self.global_transaction().clone(),
            ));
        }
        entries.insert(key, entry);
        Ok(())
    }
}
