//! Registry of every transaction in flight on this node.

mod completed;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

pub use completed::CompletedTransactionStatus;
use completed::CompletedTransactions;
use dashmap::DashMap;
use gridtx_common::{
    Address, GlobalTransaction, TopologyChangedEvent, TopologyId, TransactionIdGenerator,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::command::{TxCommand, WriteCommand};
use crate::config::{LockingMode, TransactionConfig};
use crate::error::TransactionResult;
use crate::latch::KeyDependencyTracker;
use crate::reaper::Reaper;
use crate::record::{CacheTransaction, LocalTransaction, RemoteTransaction, TransactionHandle};
use crate::spi::{RpcOptions, RpcTransport};

/// Topology id recorded once the table is stopped.
pub const CACHE_STOPPED_TOPOLOGY_ID: i64 = -1;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Maps transaction identifiers to their records, for both locally originated and remote
/// transactions.
///
/// The table is constructed explicitly and tied to one cache instance. [`start`](Self::start)
/// launches the background cleanup, [`stop`](Self::stop) shuts it down and waits for
/// in-flight transactions to drain.
pub struct TransactionTable {
    config: TransactionConfig,
    rpc: Arc<dyn RpcTransport>,
    id_generator: TransactionIdGenerator,
    local_transactions: DashMap<TransactionHandle, Arc<LocalTransaction>>,
    global_to_local: DashMap<GlobalTransaction, Arc<LocalTransaction>>,
    remote_transactions: DashMap<GlobalTransaction, Arc<RemoteTransaction>>,
    /// Last writer of every key locked by a remote prepare.
    dependencies: KeyDependencyTracker,
    /// Disabled under total order.
    completed: Option<CompletedTransactions>,
    current_topology_id: AtomicI64,
    min_topology_id: AtomicU32,
    min_topology_lock: Mutex<()>,
    reaper: Mutex<Option<Reaper>>,
}

impl TransactionTable {
    pub fn new(
        config: TransactionConfig,
        rpc: Arc<dyn RpcTransport>,
        topology_id: TopologyId,
    ) -> Arc<Self> {
        let completed = (!config.is_total_order()).then(CompletedTransactions::default);
        Arc::new(Self {
            config,
            rpc,
            id_generator: TransactionIdGenerator::new(),
            local_transactions: DashMap::new(),
            global_to_local: DashMap::new(),
            remote_transactions: DashMap::new(),
            dependencies: KeyDependencyTracker::new(),
            completed,
            current_topology_id: AtomicI64::new(i64::from(topology_id)),
            min_topology_id: AtomicU32::new(topology_id),
            min_topology_lock: Mutex::new(()),
            reaper: Mutex::new(None),
        })
    }

    #[inline]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    #[inline]
    pub fn address(&self) -> &Address {
        self.rpc.address()
    }

    /// Keys locked by prepared remote transactions. Entries go away when the owning
    /// transaction is removed from the table.
    #[inline]
    pub fn key_dependencies(&self) -> &KeyDependencyTracker {
        &self.dependencies
    }

    /// Starts the background cleanup. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) -> TransactionResult<()> {
        let mut reaper = self.reaper.lock();
        if reaper.is_none() {
            *reaper = Some(Reaper::start(self)?);
            debug!(address = %self.address(), "transaction table started");
        }
        Ok(())
    }

    /// Stops the background cleanup and waits up to the configured stop timeout for in-flight
    /// transactions to finish.
    pub fn stop(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(mut reaper) = reaper {
            reaper.shutdown();
        }
        self.current_topology_id
            .store(CACHE_STOPPED_TOPOLOGY_ID, Ordering::SeqCst);
        self.shut_down_gracefully();
    }

    pub fn is_stopped(&self) -> bool {
        self.current_topology_id.load(Ordering::SeqCst) == CACHE_STOPPED_TOPOLOGY_ID
    }

    fn shut_down_gracefully(&self) {
        debug!(
            timeout_ms = self.config.cache_stop_timeout.as_millis() as u64,
            "waiting for on-going transactions to finish"
        );
        let deadline = Instant::now() + self.config.cache_stop_timeout;
        let mut ongoing = self.has_ongoing_transactions();
        while ongoing && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
            ongoing = self.has_ongoing_transactions();
        }
        if ongoing {
            warn!(
                local = self.local_tx_count(),
                remote = self.remote_tx_count(),
                "stopping with unfinished transactions"
            );
        } else {
            debug!("all transactions terminated");
        }
    }

    fn has_ongoing_transactions(&self) -> bool {
        !self.local_transactions.is_empty() || !self.remote_transactions.is_empty()
    }

    /// The topology new transactions are stamped with, `None` once stopped.
    pub fn current_topology_id(&self) -> Option<TopologyId> {
        TopologyId::try_from(self.current_topology_id.load(Ordering::SeqCst)).ok()
    }

    /// Smallest topology id of any registered transaction.
    pub fn min_topology_id(&self) -> TopologyId {
        self.min_topology_id.load(Ordering::SeqCst)
    }

    fn stamp_topology_id(&self) -> TopologyId {
        self.current_topology_id()
            .unwrap_or_else(|| self.min_topology_id())
    }

    /// Returns the record for `handle`, registering a new one if there is none. Concurrent
    /// callers observe the same record.
    pub fn get_or_create_local_transaction(
        &self,
        handle: TransactionHandle,
        implicit: bool,
    ) -> TransactionResult<Arc<LocalTransaction>> {
        let mut created = false;
        let tx = {
            let entry = self.local_transactions.entry(handle).or_try_insert_with(|| {
                let gtx = self
                    .id_generator
                    .new_global_transaction(self.address().clone())?;
                created = true;
                TransactionResult::Ok(Arc::new(LocalTransaction::new(
                    handle,
                    gtx,
                    self.stamp_topology_id(),
                    implicit,
                )))
            })?;
            Arc::clone(entry.value())
        };
        if created {
            self.global_to_local
                .insert(tx.global_transaction().clone(), Arc::clone(&tx));
            trace!(gtx = %tx.global_transaction(), %handle, implicit, "created local transaction");
        }
        Ok(tx)
    }

    /// Returns the record for `gtx`, registering a new one if there is none. Concurrent callers
    /// observe the same record.
    pub fn get_or_create_remote_transaction(
        &self,
        gtx: &GlobalTransaction,
        modifications: Option<Vec<WriteCommand>>,
        topology_id: TopologyId,
    ) -> Arc<RemoteTransaction> {
        if let Some(existing) = self.remote_transactions.get(gtx) {
            return Arc::clone(existing.value());
        }
        let mut created = false;
        let tx = {
            let entry = self
                .remote_transactions
                .entry(gtx.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(match modifications {
                        Some(modifications) => {
                            RemoteTransaction::with_modifications(gtx.clone(), topology_id, modifications)
                        }
                        None => RemoteTransaction::new(gtx.clone(), topology_id),
                    })
                });
            Arc::clone(entry.value())
        };
        if created {
            let previous_min = self.min_topology_id.fetch_min(topology_id, Ordering::SeqCst);
            trace!(%gtx, topology_id, previous_min, "created remote transaction");
        } else {
            trace!(%gtx, "remote transaction already registered");
        }
        tx
    }

    /// The transaction identifier registered for a platform transaction.
    pub fn lookup(&self, handle: TransactionHandle) -> Option<GlobalTransaction> {
        self.local_transactions
            .get(&handle)
            .map(|tx| tx.global_transaction().clone())
    }

    pub fn get_local_transaction(&self, handle: TransactionHandle) -> Option<Arc<LocalTransaction>> {
        self.local_transactions
            .get(&handle)
            .map(|tx| Arc::clone(tx.value()))
    }

    pub fn get_local_transaction_by_gtx(
        &self,
        gtx: &GlobalTransaction,
    ) -> Option<Arc<LocalTransaction>> {
        self.global_to_local
            .get(gtx)
            .map(|tx| Arc::clone(tx.value()))
    }

    pub fn get_remote_transaction(&self, gtx: &GlobalTransaction) -> Option<Arc<RemoteTransaction>> {
        self.remote_transactions
            .get(gtx)
            .map(|tx| Arc::clone(tx.value()))
    }

    pub fn contains_local_tx(&self, gtx: &GlobalTransaction) -> bool {
        self.global_to_local.contains_key(gtx)
    }

    pub fn contains_remote_tx(&self, gtx: &GlobalTransaction) -> bool {
        self.remote_transactions.contains_key(gtx)
    }

    /// Snapshot of the local records.
    pub fn local_transactions(&self) -> Vec<Arc<LocalTransaction>> {
        self.local_transactions
            .iter()
            .map(|tx| Arc::clone(tx.value()))
            .collect()
    }

    /// Snapshot of the remote records.
    pub fn remote_transactions(&self) -> Vec<Arc<RemoteTransaction>> {
        self.remote_transactions
            .iter()
            .map(|tx| Arc::clone(tx.value()))
            .collect()
    }

    pub fn local_global_transactions(&self) -> Vec<GlobalTransaction> {
        self.global_to_local
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn remote_global_transactions(&self) -> Vec<GlobalTransaction> {
        self.remote_transactions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn local_tx_count(&self) -> usize {
        self.local_transactions.len()
    }

    pub fn remote_tx_count(&self) -> usize {
        self.remote_transactions.len()
    }

    /// Unregisters `tx` and releases transactions waiting on it. Returns whether it was
    /// registered.
    pub fn remove_local_transaction(&self, tx: &LocalTransaction) -> bool {
        let removed = self
            .local_transactions
            .remove_if(&tx.handle(), |_, current| std::ptr::eq(current.as_ref(), tx));
        match removed {
            Some((_, removed)) => {
                self.global_to_local.remove(removed.global_transaction());
                self.release_resources(removed.as_ref());
                true
            }
            None => false,
        }
    }

    pub fn remove_remote_transaction(
        &self,
        gtx: &GlobalTransaction,
    ) -> Option<Arc<RemoteTransaction>> {
        let removed = self.remote_transactions.remove(gtx).map(|(_, tx)| tx);
        trace!(%gtx, removed = removed.is_some(), "removing remote transaction");
        if let Some(tx) = &removed {
            self.release_resources(tx.as_ref());
        }
        removed
    }

    /// Called once a remote transaction committed. The record only goes away here when no
    /// completion notification will follow.
    pub fn remote_transaction_committed(&self, gtx: &GlobalTransaction, one_phase: bool) {
        let optimistic_one_phase =
            one_phase && self.config.locking_mode == LockingMode::Optimistic;
        if self.config.second_phase_async || self.config.is_total_order() || optimistic_one_phase {
            self.remove_remote_transaction(gtx);
        }
    }

    /// Rolls back a remote transaction: the record rejects further writes, its outcome is
    /// recorded and it is unregistered.
    pub fn rollback_remote_transaction(
        &self,
        gtx: &GlobalTransaction,
    ) -> Option<Arc<RemoteTransaction>> {
        if let Some(tx) = self.get_remote_transaction(gtx) {
            tx.mark_for_rollback();
            tx.clear_looked_up_entries();
        }
        self.mark_transaction_completed(gtx, false);
        let removed = self.remove_remote_transaction(gtx);
        trace!(%gtx, "rollback of remote transaction complete");
        removed
    }

    fn release_resources(&self, tx: &dyn CacheTransaction) {
        self.recalculate_min_topology_id_if_needed(tx.topology_id());
        self.dependencies.release(tx.latch(), &tx.affected_keys());
        tx.notify_on_transaction_finished();
        trace!(gtx = %tx.global_transaction(), "removed from transaction table");
    }

    fn recalculate_min_topology_id_if_needed(&self, removed_topology_id: TopologyId) {
        let Some(current) = self.current_topology_id() else {
            return;
        };
        let min = self.min_topology_id();
        if removed_topology_id == min && removed_topology_id < current {
            self.calculate_min_topology_id(Some(removed_topology_id));
        }
    }

    /// `removed` is the topology of the transaction that triggered the recalculation, `None`
    /// when a topology change did.
    fn calculate_min_topology_id(&self, removed: Option<TopologyId>) {
        let _guard = self.min_topology_lock.lock();
        let Some(current) = self.current_topology_id() else {
            return;
        };
        let min = self.min_topology_id();
        if removed.is_some_and(|id| id != min || id >= current) {
            return;
        }
        let found = self
            .local_transactions
            .iter()
            .map(|tx| tx.topology_id())
            .chain(self.remote_transactions.iter().map(|tx| tx.topology_id()))
            .fold(current, TopologyId::min);
        if found != min {
            trace!(from = min, to = found, "changing minimum topology id");
            self.min_topology_id.store(found, Ordering::SeqCst);
        }
    }

    /// Reacts to a membership change: records the new topology and rolls back transactions
    /// tied to the members that left. The cleanup runs on the reaper's worker when started.
    pub fn on_topology_changed(self: &Arc<Self>, event: &TopologyChangedEvent) {
        if self.is_stopped() {
            return;
        }
        let topology_id = event.new_topology().topology_id();
        self.current_topology_id
            .store(i64::from(topology_id), Ordering::SeqCst);
        debug!(topology_id, "topology changed, recalculating minimum topology id");
        self.calculate_min_topology_id(None);

        let leavers = event.leavers();
        if leavers.is_empty() {
            return;
        }
        let members = event.new_topology().members().to_vec();
        let table: Weak<Self> = Arc::downgrade(self);
        let task = move || {
            if let Some(table) = table.upgrade() {
                table.cleanup_leaver_transactions(&members);
                table.release_locks_on_leavers(&leavers);
            }
        };

        let reaper = self.reaper.lock();
        if let Some(reaper) = reaper.as_ref() {
            reaper.submit(task);
            return;
        }
        drop(reaper);
        task();
    }

    /// Rolls back every remote transaction whose originator is not in `members`.
    pub fn cleanup_leaver_transactions(&self, members: &[Address]) -> usize {
        trace!(
            ?members,
            remote = self.remote_tx_count(),
            "checking for transactions originated on leavers"
        );
        let to_kill: Vec<GlobalTransaction> = self
            .remote_transactions
            .iter()
            .filter(|entry| !members.contains(entry.key().address()))
            .map(|entry| entry.key().clone())
            .collect();

        if to_kill.is_empty() {
            trace!("no remote transactions pertain to originators who left the cluster");
        } else {
            debug!(
                count = to_kill.len(),
                "originating node left the cluster for remote transactions"
            );
        }
        for gtx in &to_kill {
            debug!(%gtx, originator = %gtx.address(), "rolling back transaction because its originator left");
            self.rollback_remote_transaction(gtx);
        }
        to_kill.len()
    }

    /// Marks for rollback every local transaction holding locks on a leaver and asks those
    /// nodes to release them. Delivery is best effort.
    pub fn release_locks_on_leavers(&self, leavers: &HashSet<Address>) {
        let affected: Vec<Arc<LocalTransaction>> = self
            .local_transactions
            .iter()
            .filter(|tx| tx.has_remote_locks_acquired(leavers))
            .map(|tx| Arc::clone(tx.value()))
            .collect();

        let options = RpcOptions::sync(self.config.rpc_timeout).with_ignore_unreachable(true);
        for tx in affected {
            let gtx = tx.global_transaction().clone();
            tx.mark_for_rollback();
            let nodes = tx.filter_remote_locks_acquired(leavers);
            debug!(%gtx, ?nodes, "releasing locks held on leavers");
            let command = TxCommand::TxCompletionNotification {
                gtx: gtx.clone(),
                topology_id: tx.topology_id(),
            };
            if let Err(error) = self.rpc.invoke_remotely(Some(&nodes), &command, &options) {
                debug!(%gtx, %error, "could not release locks on leavers");
            }
        }
    }

    /// Rolls back remote transactions older than the completed-transaction timeout.
    pub fn cleanup_timed_out_transactions_at(&self, now: Instant) -> usize {
        let timeout = self.config.completed_tx_timeout;
        trace!(timeout_ms = timeout.as_millis() as u64, "cleaning up old remote transactions");
        let to_kill: Vec<GlobalTransaction> = self
            .remote_transactions
            .iter()
            .filter_map(|entry| {
                let age = entry.age(now);
                (age > timeout).then(|| {
                    warn!(gtx = %entry.key(), age_ms = age.as_millis() as u64, "remote transaction timed out, rolling back");
                    entry.key().clone()
                })
            })
            .collect();
        for gtx in &to_kill {
            self.rollback_remote_transaction(gtx);
        }
        to_kill.len()
    }

    /// Records the outcome of a finished transaction so late prepares can be discarded.
    pub fn mark_transaction_completed(&self, gtx: &GlobalTransaction, committed: bool) {
        if let Some(completed) = &self.completed {
            completed.mark_completed(gtx.clone(), committed, Instant::now());
        }
    }

    pub fn is_transaction_completed(&self, gtx: &GlobalTransaction) -> bool {
        self.completed
            .as_ref()
            .is_some_and(|completed| completed.is_completed(gtx))
    }

    pub fn completed_transaction_status(&self, gtx: &GlobalTransaction) -> CompletedTransactionStatus {
        self.completed
            .as_ref()
            .map_or(CompletedTransactionStatus::NotCompleted, |completed| {
                completed.status(gtx)
            })
    }

    pub fn cleanup_completed_transactions_at(&self, now: Instant) -> usize {
        match &self.completed {
            Some(completed) => {
                completed.cleanup(now, self.config.completed_tx_timeout, &self.rpc.members())
            }
            None => 0,
        }
    }

    pub fn completed_tx_count(&self) -> usize {
        self.completed.as_ref().map_or(0, CompletedTransactions::len)
    }

    /// One pass of the periodic sweep.
    pub(crate) fn sweep(&self) {
        let now = Instant::now();
        let pruned = self.cleanup_completed_transactions_at(now);
        let killed = self.cleanup_timed_out_transactions_at(now);
        if pruned > 0 || killed > 0 {
            trace!(pruned, killed, "registry sweep finished");
        }
    }
}
