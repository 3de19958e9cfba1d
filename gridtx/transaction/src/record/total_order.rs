use std::time::{Duration, Instant};

use gridtx_common::{EntryVersionsMap, GlobalTransaction};
use parking_lot::{Condvar, Mutex};

use crate::error::{TransactionError, TransactionResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Nothing delivered yet.
    Waiting,
    Preparing,
    Prepared,
    /// The commit overtook the prepare.
    CommitReceived(EntryVersionsMap),
    /// The rollback overtook the prepare.
    RollbackReceived,
    Finished,
}

/// How a prepare delivered under total order must proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareDecision {
    /// Prepare normally and wait for the second phase.
    Proceed,
    /// The commit already arrived: prepare and commit at once with these versions.
    OnePhase(EntryVersionsMap),
    /// The rollback already arrived.
    Discard,
    /// The prepare was delivered before.
    Duplicate,
}

/// Orders the second phase of a remote transaction against its prepare.
#[derive(Debug)]
pub struct TotalOrderState {
    phase: Mutex<Phase>,
    cond: Condvar,
}

impl TotalOrderState {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Waiting),
            cond: Condvar::new(),
        }
    }

    /// Called when the prepare is delivered.
    pub fn begin_prepare(&self) -> PrepareDecision {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Preparing) {
            Phase::Waiting => PrepareDecision::Proceed,
            Phase::CommitReceived(versions) => PrepareDecision::OnePhase(versions),
            Phase::RollbackReceived => {
                *phase = Phase::Finished;
                PrepareDecision::Discard
            }
            previous => {
                *phase = previous;
                PrepareDecision::Duplicate
            }
        }
    }

    /// The prepare completed and now waits for the second phase.
    pub fn prepared(&self) {
        let mut phase = self.phase.lock();
        if *phase == Phase::Preparing {
            *phase = Phase::Prepared;
        }
        self.cond.notify_all();
    }

    /// Nothing further happens for this transaction.
    pub fn finish(&self) {
        *self.phase.lock() = Phase::Finished;
        self.cond.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        *self.phase.lock() == Phase::Finished
    }

    /// Called when the commit (`commit == true`) or rollback arrives.
    ///
    /// Returns `true` when the caller must run the second phase itself. If the prepare was not
    /// delivered yet the decision is recorded for it and `false` is returned. A prepare in
    /// progress is waited for, up to `timeout`.
    pub fn wait_prepared(
        &self,
        gtx: &GlobalTransaction,
        commit: bool,
        versions: Option<&EntryVersionsMap>,
        timeout: Duration,
    ) -> TransactionResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut phase = self.phase.lock();
        loop {
            match &*phase {
                Phase::Waiting => {
                    *phase = if commit {
                        Phase::CommitReceived(versions.cloned().unwrap_or_default())
                    } else {
                        Phase::RollbackReceived
                    };
                    return Ok(false);
                }
                Phase::Prepared => return Ok(true),
                Phase::Preparing => {
                    if self.cond.wait_until(&mut phase, deadline).timed_out()
                        && *phase == Phase::Preparing
                    {
                        return Err(TransactionError::Timeout {
                            gtx: gtx.clone(),
                            timeout,
                            waiting_for: "the prepare to finish",
                        });
                    }
                }
                Phase::CommitReceived(_) | Phase::RollbackReceived | Phase::Finished => {
                    return Ok(false);
                }
            }
        }
    }
}

impl Default for TotalOrderState {
    fn default() -> Self {
        Self::new()
    }
}
