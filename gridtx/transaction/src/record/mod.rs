//! In-memory state of one distributed transaction.
//!
//! [`LocalTransaction`] is the originator's view, [`RemoteTransaction`] the view of a participant
//! executing commands on behalf of another member. Both share [`TxCore`] and are driven through
//! the [`CacheTransaction`] trait.

mod local;
mod remote;
mod total_order;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use gridtx_common::{EntryVersion, EntryVersionsMap, GlobalTransaction, Key, TopologyId};
pub use local::{LocalTransaction, TransactionHandle};
use parking_lot::RwLock;
pub use remote::RemoteTransaction;
pub use total_order::{PrepareDecision, TotalOrderState};

use crate::command::{WriteCommand, affected_keys_of};
use crate::entry::MvccEntry;
use crate::error::{TransactionError, TransactionResult};
use crate::latch::TxDependencyLatch;

/// State shared by both record variants.
#[derive(Debug)]
pub struct TxCore {
    gtx: GlobalTransaction,
    topology_id: TopologyId,
    created_at: Instant,
    modifications: RwLock<Vec<WriteCommand>>,
    looked_up_entries: RwLock<HashMap<Key, MvccEntry>>,
    /// Only written while holding the `modifications` write lock.
    prepared: AtomicBool,
    affected_keys: OnceLock<HashSet<Key>>,
    updated_versions: RwLock<Option<EntryVersionsMap>>,
    versions_seen: RwLock<EntryVersionsMap>,
    latch: Arc<TxDependencyLatch>,
}

impl TxCore {
    pub fn new(gtx: GlobalTransaction, topology_id: TopologyId) -> Self {
        Self::with_modifications(gtx, topology_id, Vec::new())
    }

    pub fn with_modifications(
        gtx: GlobalTransaction,
        topology_id: TopologyId,
        modifications: Vec<WriteCommand>,
    ) -> Self {
        let latch = Arc::new(TxDependencyLatch::new(gtx.clone()));
        Self {
            gtx,
            topology_id,
            created_at: Instant::now(),
            modifications: RwLock::new(modifications),
            looked_up_entries: RwLock::new(HashMap::new()),
            prepared: AtomicBool::new(false),
            affected_keys: OnceLock::new(),
            updated_versions: RwLock::new(None),
            versions_seen: RwLock::new(EntryVersionsMap::new()),
            latch,
        }
    }
}

/// Operations common to local and remote transaction records.
///
/// Callers serialize protocol steps per transaction. Only the rollback flag is expected to be
/// touched from other threads.
pub trait CacheTransaction: Send + Sync + fmt::Debug {
    fn core(&self) -> &TxCore;

    fn is_marked_for_rollback(&self) -> bool;

    #[inline]
    fn global_transaction(&self) -> &GlobalTransaction {
        &self.core().gtx
    }

    /// Topology the transaction was started in.
    #[inline]
    fn topology_id(&self) -> TopologyId {
        self.core().topology_id
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.core().created_at)
    }

    fn modifications(&self) -> Vec<WriteCommand> {
        self.core().modifications.read().clone()
    }

    fn has_modifications(&self) -> bool {
        !self.core().modifications.read().is_empty()
    }

    /// Appends a write. Fails once the transaction is prepared.
    fn add_modification(&self, modification: WriteCommand) -> TransactionResult<()> {
        let core = self.core();
        let mut modifications = core.modifications.write();
        if core.prepared.load(Ordering::Acquire) {
            return Err(TransactionError::AlreadyPrepared(core.gtx.clone()));
        }
        modifications.push(modification);
        Ok(())
    }

    /// Replaces the whole write list. Fails once the transaction is prepared.
    fn set_modifications(&self, modifications: Vec<WriteCommand>) -> TransactionResult<()> {
        let core = self.core();
        let mut current = core.modifications.write();
        if core.prepared.load(Ordering::Acquire) {
            return Err(TransactionError::AlreadyPrepared(core.gtx.clone()));
        }
        *current = modifications;
        Ok(())
    }

    fn put_looked_up_entry(&self, key: Key, entry: MvccEntry) -> TransactionResult<()> {
        self.core().looked_up_entries.write().insert(key, entry);
        Ok(())
    }

    fn lookup_entry(&self, key: &Key) -> Option<MvccEntry> {
        self.core().looked_up_entries.read().get(key).cloned()
    }

    fn remove_looked_up_entry(&self, key: &Key) -> Option<MvccEntry> {
        self.core().looked_up_entries.write().remove(key)
    }

    fn clear_looked_up_entries(&self) {
        self.core().looked_up_entries.write().clear();
    }

    fn looked_up_entries(&self) -> HashMap<Key, MvccEntry> {
        self.core().looked_up_entries.read().clone()
    }

    /// No writes and nothing read.
    fn is_read_only(&self) -> bool {
        let core = self.core();
        core.modifications.read().is_empty() && core.looked_up_entries.read().is_empty()
    }

    #[inline]
    fn is_prepared(&self) -> bool {
        self.core().prepared.load(Ordering::Acquire)
    }

    /// Freezes the write list. There is no way back.
    fn mark_prepared(&self) {
        let core = self.core();
        let modifications = core.modifications.write();
        core.affected_keys
            .get_or_init(|| affected_keys_of(&modifications));
        core.prepared.store(true, Ordering::Release);
    }

    /// Keys written by this transaction, cached once prepared.
    fn affected_keys(&self) -> HashSet<Key> {
        let core = self.core();
        if let Some(keys) = core.affected_keys.get() {
            return keys.clone();
        }
        affected_keys_of(&core.modifications.read())
    }

    fn updated_versions(&self) -> Option<EntryVersionsMap> {
        self.core().updated_versions.read().clone()
    }

    fn set_updated_versions(&self, versions: EntryVersionsMap) {
        *self.core().updated_versions.write() = Some(versions);
    }

    /// Merges `versions` over the ones already recorded, `versions` winning per key.
    fn merge_updated_versions(&self, versions: &EntryVersionsMap) {
        let mut current = self.core().updated_versions.write();
        current
            .get_or_insert_with(EntryVersionsMap::new)
            .merge(versions);
    }

    fn add_version_seen(&self, key: Key, version: Option<EntryVersion>) {
        self.core().versions_seen.write().insert(key, version);
    }

    /// Versions read by this transaction: explicitly recorded ones first, then the versions
    /// carried by the looked-up entries.
    fn versions_seen(&self) -> EntryVersionsMap {
        let core = self.core();
        let mut seen = core.versions_seen.read().clone();
        for (key, entry) in core.looked_up_entries.read().iter() {
            if !seen.contains_key(key) {
                seen.insert(key.clone(), entry.version().copied());
            }
        }
        seen
    }

    fn latch(&self) -> &Arc<TxDependencyLatch> {
        &self.core().latch
    }

    /// Opens the dependency latch so transactions waiting on this one proceed.
    fn notify_on_transaction_finished(&self) -> bool {
        self.core().latch.release()
    }
}

#[cfg(test)]
mod tests {
    use gridtx_common::{Address, Value};

    use super::*;

    fn put(key: &'static str) -> WriteCommand {
        WriteCommand::Put {
            key: Key::from(key),
            value: Value::from("v"),
        }
    }

    #[test]
    fn test_prepared_freezes_modifications() {
        let tx = RemoteTransaction::new(GlobalTransaction::new(Address::new("a"), 1), 1);
        tx.add_modification(put("a")).unwrap();
        tx.mark_prepared();

        let err = tx.add_modification(put("b")).unwrap_err();
        assert!(matches!(err, TransactionError::AlreadyPrepared(_)));
        assert!(tx.set_modifications(vec![]).is_err());
        assert!(tx.is_prepared());
        assert_eq!(tx.modifications().len(), 1);
        assert_eq!(tx.affected_keys(), HashSet::from([Key::from("a")]));

        tx.mark_prepared();
        assert!(tx.is_prepared());
    }

    #[test]
    fn test_prepare_races_with_writers() {
        let tx = RemoteTransaction::new(GlobalTransaction::new(Address::new("a"), 1), 1);
        let accepted = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        if tx.add_modification(put("k")).is_ok() {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
            s.spawn(|| tx.mark_prepared());
        });
        let frozen = tx.modifications().len();
        assert_eq!(frozen, accepted.load(Ordering::SeqCst));
        assert!(tx.add_modification(put("k")).is_err());
        assert_eq!(tx.modifications().len(), frozen);
    }

    #[test]
    fn test_read_only_and_versions_seen() {
        let tx = LocalTransaction::new(
            TransactionHandle::new(1),
            GlobalTransaction::new(Address::new("a"), 1),
            1,
            false,
        );
        assert!(tx.is_read_only());

        let stored = crate::entry::InternalEntry::new(Value::from("v"), EntryVersion::new(1, 3));
        tx.put_looked_up_entry(Key::from("k"), MvccEntry::read(Key::from("k"), Some(stored)))
            .unwrap();
        tx.add_version_seen(Key::from("j"), None);
        assert!(!tx.is_read_only());

        let seen = tx.versions_seen();
        assert_eq!(seen.get(&Key::from("k")), Some(&EntryVersion::new(1, 3)));
        assert!(seen.contains_key(&Key::from("j")));

        assert!(tx.remove_looked_up_entry(&Key::from("k")).is_some());
        assert!(tx.lookup_entry(&Key::from("k")).is_none());
    }

    #[test]
    fn test_updated_versions_merge_per_key() {
        let tx = RemoteTransaction::new(GlobalTransaction::new(Address::new("a"), 1), 1);
        assert!(tx.updated_versions().is_none());
        tx.merge_updated_versions(
            &[(Key::from("a"), Some(EntryVersion::new(1, 1)))]
                .into_iter()
                .collect(),
        );
        tx.merge_updated_versions(
            &[(Key::from("a"), Some(EntryVersion::new(1, 2)))]
                .into_iter()
                .collect(),
        );
        let versions = tx.updated_versions().unwrap();
        assert_eq!(versions.get(&Key::from("a")), Some(&EntryVersion::new(1, 2)));
    }
}
