//! Coordinator variant for clustered caches.
//!
//! The second phase may run on a background executor, and once it finishes the owners of the
//! written keys are told to release the transaction's locks.

use std::sync::Arc;

use gridtx_common::{Address, CacheTopology};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{error, trace, warn};

use crate::command::TxCommand;
use crate::config::TransactionConfig;
use crate::coordinator::{CommitOutcome, PrepareOutcome, TransactionCoordinator};
use crate::error::{CoordinatorResult, TransactionResult};
use crate::record::{CacheTransaction, LocalTransaction};
use crate::spi::{OwnershipOracle, RpcOptions, RpcTransport};

#[derive(Clone)]
pub struct ClusteredTransactionCoordinator {
    inner: Arc<TransactionCoordinator>,
    rpc: Arc<dyn RpcTransport>,
    ownership: Arc<dyn OwnershipOracle>,
    executor: Arc<ThreadPool>,
}

impl ClusteredTransactionCoordinator {
    pub fn new(
        inner: TransactionCoordinator,
        rpc: Arc<dyn RpcTransport>,
        ownership: Arc<dyn OwnershipOracle>,
    ) -> TransactionResult<Self> {
        let address = rpc.address().clone();
        let executor = ThreadPoolBuilder::new()
            .num_threads(inner.config().async_executor_threads.max(1))
            .thread_name(move |i| format!("tx-async-{address}-{i}"))
            .build()?;
        Ok(Self {
            inner: Arc::new(inner),
            rpc,
            ownership,
            executor: Arc::new(executor),
        })
    }

    #[inline]
    pub fn config(&self) -> &TransactionConfig {
        self.inner.config()
    }

    #[inline]
    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.inner
    }

    pub fn prepare(&self, tx: &Arc<LocalTransaction>) -> CoordinatorResult<PrepareOutcome> {
        self.inner.prepare(tx)
    }

    /// Commits `tx`. The commit runs inline when configured synchronous, for one-phase commits
    /// and when the topology moved since the transaction started. Otherwise it is handed to the
    /// background executor and [`CommitOutcome::Deferred`] is returned.
    pub fn commit(
        &self,
        tx: &Arc<LocalTransaction>,
        one_phase: bool,
    ) -> CoordinatorResult<CommitOutcome> {
        let topology = self.ownership.current_topology();
        let one_phase = one_phase || self.config().use_one_phase_commit;
        if self.config().sync_commit_phase || one_phase || self.is_topology_changed(tx, &topology) {
            let outcome = self.inner.commit(tx, one_phase)?;
            self.commit_finished(tx, outcome, &topology);
            return Ok(outcome);
        }

        if tx.is_marked_for_rollback() {
            let outcome = self.inner.commit(tx, one_phase)?;
            self.commit_finished(tx, outcome, &topology);
            return Ok(outcome);
        }
        self.inner.contexts().suspend();
        let this = self.clone();
        let tx = Arc::clone(tx);
        trace!(gtx = %tx.global_transaction(), "committing in the background");
        self.executor.spawn(move || match this.inner.commit(&tx, false) {
            Ok(outcome) => {
                trace!(gtx = %tx.global_transaction(), ?outcome, "background commit finished");
                this.commit_finished(&tx, outcome, &topology);
            }
            Err(err) => {
                error!(gtx = %tx.global_transaction(), error = %err, "background commit failed")
            }
        });
        Ok(CommitOutcome::Deferred)
    }

    /// Rolls `tx` back, in the background unless configured synchronous or the topology moved.
    pub fn rollback(&self, tx: &Arc<LocalTransaction>) -> CoordinatorResult<()> {
        let topology = self.ownership.current_topology();
        if self.config().sync_rollback_phase || self.is_topology_changed(tx, &topology) {
            self.inner.rollback(tx)?;
            self.release_locks(tx, &topology);
            return Ok(());
        }

        self.inner.contexts().suspend();
        let this = self.clone();
        let tx = Arc::clone(tx);
        trace!(gtx = %tx.global_transaction(), "rolling back in the background");
        self.executor.spawn(move || match this.inner.rollback(&tx) {
            Ok(()) => this.release_locks(&tx, &topology),
            Err(err) => {
                error!(gtx = %tx.global_transaction(), error = %err, "background rollback failed")
            }
        });
        Ok(())
    }

    /// Whether the topology moved since `tx` started, so the lock state computed at prepare
    /// time can no longer be trusted.
    pub fn is_topology_changed(&self, tx: &LocalTransaction, topology: &CacheTopology) -> bool {
        tx.topology_id() != topology.topology_id()
    }

    /// Tells the owners of the keys written by `tx` under `topology` that it finished.
    /// A committed transaction, or a prepared one rolled back at commit time, still holds
    /// remote locks.
    fn commit_finished(
        &self,
        tx: &LocalTransaction,
        outcome: CommitOutcome,
        topology: &CacheTopology,
    ) {
        let holds_locks = match outcome {
            CommitOutcome::Committed => true,
            CommitOutcome::RollbackOnly => tx.is_prepared(),
            CommitOutcome::Deferred => false,
        };
        if holds_locks {
            self.release_locks(tx, topology);
        }
    }

    fn release_locks(&self, tx: &LocalTransaction, topology: &CacheTopology) {
        let config = self.config();
        if config.recovery_enabled || config.second_phase_async {
            return;
        }
        let gtx = tx.global_transaction();
        let keys = tx.affected_keys();
        if keys.is_empty() {
            return;
        }
        let recipients: Option<Vec<Address>> =
            self.ownership.owners(topology, &keys).map(|owners| {
                owners
                    .into_iter()
                    .filter(|owner| owner != self.rpc.address())
                    .collect()
            });
        if recipients.as_ref().is_some_and(Vec::is_empty) {
            return;
        }
        trace!(%gtx, ?recipients, "sending transaction completion notification");
        let command = TxCommand::TxCompletionNotification {
            gtx: gtx.clone(),
            topology_id: topology.topology_id(),
        };
        let options = RpcOptions::asynchronous(config.rpc_timeout);
        if let Err(err) = self
            .rpc
            .invoke_remotely(recipients.as_deref(), &command, &options)
        {
            warn!(%gtx, error = %err, "failed to release remote locks");
        }
    }
}
