//! Participant side of the protocol: applies commands received on behalf of other members.

use std::collections::HashMap;
use std::sync::Arc;

use gridtx_common::{Address, EntryVersion, EntryVersionsMap, Key, VersionGenerator};
use tracing::{debug, trace};

use crate::command::{
    CommandResponse, CommitCommand, PrepareCommand, RollbackCommand, TxCommand, WriteCommand,
    affected_keys_of,
};
use crate::config::TransactionConfig;
use crate::entry::MvccEntry;
use crate::error::TransactionResult;
use crate::record::{CacheTransaction, PrepareDecision, RemoteTransaction};
use crate::spi::{DataContainer, OwnershipOracle};
use crate::table::TransactionTable;
use crate::write_skew::{perform_total_order_write_skew_check, perform_write_skew_check};

pub struct RemoteTransactionHandler {
    table: Arc<TransactionTable>,
    container: Arc<dyn DataContainer>,
    versions: Arc<dyn VersionGenerator>,
    ownership: Arc<dyn OwnershipOracle>,
}

impl RemoteTransactionHandler {
    pub fn new(
        table: Arc<TransactionTable>,
        container: Arc<dyn DataContainer>,
        versions: Arc<dyn VersionGenerator>,
        ownership: Arc<dyn OwnershipOracle>,
    ) -> Self {
        Self {
            table,
            container,
            versions,
            ownership,
        }
    }

    #[inline]
    pub fn address(&self) -> &Address {
        self.table.address()
    }

    #[inline]
    pub fn table(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    #[inline]
    fn config(&self) -> &TransactionConfig {
        self.table.config()
    }

    pub fn handle(&self, command: &TxCommand) -> TransactionResult<CommandResponse> {
        trace!(
            address = %self.address(),
            gtx = %command.global_transaction(),
            command = command.name(),
            "handling remote command"
        );
        match command {
            TxCommand::Prepare(cmd) => self.handle_prepare(cmd),
            TxCommand::Commit(cmd) => self.handle_commit(cmd),
            TxCommand::Rollback(cmd) => self.handle_rollback(cmd),
            TxCommand::TxCompletionNotification { gtx, .. } => {
                self.table.remove_remote_transaction(gtx);
                Ok(CommandResponse::Unit)
            }
        }
    }

    fn handle_prepare(&self, cmd: &PrepareCommand) -> TransactionResult<CommandResponse> {
        let gtx = &cmd.gtx;
        let tx = self.table.get_or_create_remote_transaction(
            gtx,
            Some(cmd.modifications.clone()),
            cmd.topology_id,
        );
        if !tx.skip_completed_check() && self.table.is_transaction_completed(gtx) {
            debug!(%gtx, "transaction already completed, discarding prepare");
            self.table.remove_remote_transaction(gtx);
            return Ok(CommandResponse::Discarded);
        }

        let total_order = self.config().is_total_order();
        let (one_phase, commit_versions) = if total_order {
            match tx.total_order_state().begin_prepare() {
                PrepareDecision::Proceed => (cmd.one_phase, None),
                PrepareDecision::OnePhase(versions) => (true, Some(versions)),
                PrepareDecision::Discard => {
                    trace!(%gtx, "rollback arrived before prepare, discarding");
                    self.table.remove_remote_transaction(gtx);
                    return Ok(CommandResponse::Discarded);
                }
                PrepareDecision::Duplicate => {
                    trace!(%gtx, "prepare already delivered");
                    return Ok(tx
                        .updated_versions()
                        .map_or(CommandResponse::Unit, CommandResponse::Versions));
                }
            }
        } else {
            (cmd.one_phase, None)
        };

        // Wait for earlier transactions writing the same keys to finish.
        let dependencies = self.table.key_dependencies();
        let pending = dependencies.register(tx.latch(), &affected_keys_of(&cmd.modifications));
        let result = dependencies
            .await_all(gtx, &pending, self.config().lock_acquisition_timeout)
            .and_then(|()| self.prepare(&tx, cmd, one_phase, commit_versions));

        if total_order {
            if result.is_ok() && !one_phase {
                tx.total_order_state().prepared();
            } else {
                tx.total_order_state().finish();
            }
        }
        if let Err(err) = &result {
            debug!(%gtx, error = %err, "prepare failed, rolling back");
            self.table.rollback_remote_transaction(gtx);
        }
        result
    }

    fn prepare(
        &self,
        tx: &Arc<RemoteTransaction>,
        cmd: &PrepareCommand,
        one_phase: bool,
        commit_versions: Option<EntryVersionsMap>,
    ) -> TransactionResult<CommandResponse> {
        let gtx = &cmd.gtx;
        if tx.is_prepared() && !tx.is_missing_looked_up_entries() {
            trace!(%gtx, "transaction already prepared");
            return Ok(tx
                .updated_versions()
                .map_or(CommandResponse::Unit, CommandResponse::Versions));
        }
        if !tx.is_prepared() {
            tx.set_modifications(cmd.modifications.clone())?;
        }
        self.repopulate_entries(tx, &cmd.modifications)?;

        let mut response = CommandResponse::Unit;
        if self.config().needs_write_skew_check() {
            let address = self.address();
            let should_check = |key: &Key| self.ownership.is_owner(address, key);
            let versions = if self.config().is_total_order() {
                perform_total_order_write_skew_check(
                    tx.as_ref(),
                    &cmd.modifications,
                    &cmd.versions_seen,
                    self.container.as_ref(),
                    self.versions.as_ref(),
                    should_check,
                )?
            } else {
                perform_write_skew_check(
                    tx.as_ref(),
                    &cmd.modifications,
                    &cmd.versions_seen,
                    self.container.as_ref(),
                    self.versions.as_ref(),
                    should_check,
                )?
            };
            tx.set_updated_versions(versions.clone());
            response = CommandResponse::Versions(versions);
        }
        tx.mark_prepared();

        if one_phase {
            if let Some(versions) = commit_versions {
                tx.merge_updated_versions(&versions);
            }
            self.commit_entries(tx)?;
            self.table.mark_transaction_completed(gtx, true);
            self.table.remote_transaction_committed(gtx, true);
            trace!(%gtx, "one-phase prepare committed");
        } else {
            trace!(%gtx, "remote transaction prepared");
        }
        Ok(response)
    }

    fn handle_commit(&self, cmd: &CommitCommand) -> TransactionResult<CommandResponse> {
        let gtx = &cmd.gtx;
        let total_order = self.config().is_total_order();
        let tx = if total_order {
            self.table
                .get_or_create_remote_transaction(gtx, None, cmd.topology_id)
        } else {
            match self.table.get_remote_transaction(gtx) {
                Some(tx) => tx,
                None => {
                    trace!(%gtx, "no remote transaction to commit");
                    if !self.table.is_transaction_completed(gtx) {
                        self.table.mark_transaction_completed(gtx, true);
                    }
                    return Ok(CommandResponse::Unit);
                }
            }
        };
        if total_order
            && !tx.total_order_state().wait_prepared(
                gtx,
                true,
                Some(&cmd.updated_versions),
                self.config().rpc_timeout,
            )?
        {
            trace!(%gtx, "commit recorded for the pending prepare");
            return Ok(CommandResponse::Unit);
        }

        if tx.is_missing_looked_up_entries() {
            self.repopulate_entries(&tx, &tx.modifications())?;
        }
        tx.merge_updated_versions(&cmd.updated_versions);
        self.commit_entries(&tx)?;
        self.table.mark_transaction_completed(gtx, true);
        self.table.remote_transaction_committed(gtx, false);
        if total_order {
            tx.total_order_state().finish();
        }
        trace!(%gtx, "remote transaction committed");
        Ok(CommandResponse::Unit)
    }

    fn handle_rollback(&self, cmd: &RollbackCommand) -> TransactionResult<CommandResponse> {
        let gtx = &cmd.gtx;
        if self.config().is_total_order() {
            let tx = self
                .table
                .get_or_create_remote_transaction(gtx, None, cmd.topology_id);
            let state = tx.total_order_state();
            if !state.wait_prepared(gtx, false, None, self.config().rpc_timeout)? {
                trace!(%gtx, "rollback recorded for the pending prepare");
                return Ok(CommandResponse::Unit);
            }
            state.finish();
        }
        self.table.rollback_remote_transaction(gtx);
        Ok(CommandResponse::Unit)
    }

    /// Reads the written keys from the container and applies the writes on top.
    fn repopulate_entries(
        &self,
        tx: &RemoteTransaction,
        modifications: &[WriteCommand],
    ) -> TransactionResult<()> {
        let mut entries: HashMap<Key, MvccEntry> = HashMap::new();
        for modification in modifications {
            match modification {
                WriteCommand::Put { key, value } => {
                    self.entry_for(&mut entries, key).set_value(value.clone());
                }
                WriteCommand::Remove { key } => self.entry_for(&mut entries, key).set_removed(),
                WriteCommand::PutAll { entries: writes } => {
                    for (key, value) in writes {
                        self.entry_for(&mut entries, key).set_value(value.clone());
                    }
                }
            }
        }
        for (key, entry) in entries {
            tx.put_looked_up_entry(key, entry)?;
        }
        tx.set_missing_looked_up_entries(false);
        Ok(())
    }

    fn entry_for<'a>(&self, entries: &'a mut HashMap<Key, MvccEntry>, key: &Key) -> &'a mut MvccEntry {
        entries
            .entry(key.clone())
            .or_insert_with(|| MvccEntry::read(key.clone(), self.container.get(key)))
    }

    /// Writes the changed entries owned by this node through to the container.
    fn commit_entries(&self, tx: &RemoteTransaction) -> TransactionResult<()> {
        let updated = tx.updated_versions().unwrap_or_default();
        for (key, entry) in tx.looked_up_entries() {
            if !entry.is_changed() || !self.ownership.is_owner(self.address(), &key) {
                continue;
            }
            let version = match updated.get(&key) {
                Some(version) => *version,
                None => self.next_version(&key)?,
            };
            entry.commit(self.container.as_ref(), version);
        }
        Ok(())
    }

    fn next_version(&self, key: &Key) -> TransactionResult<EntryVersion> {
        Ok(match self.container.get(key) {
            Some(stored) => self.versions.increment(&stored.version)?,
            None => self.versions.generate_new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    use dashmap::DashMap;
    use gridtx_common::{CacheTopology, GlobalTransaction, NumericVersionGenerator, Value};

    use super::*;
    use crate::command::CommandResponse;
    use crate::entry::InternalEntry;
    use crate::error::{RpcError, TransactionError};
    use crate::spi::{RpcOptions, RpcTransport};
    use crate::table::CompletedTransactionStatus;
    use crate::{TransactionProtocol, TxCommand};

    #[derive(Default)]
    struct Container(DashMap<Key, InternalEntry>);

    impl DataContainer for Container {
        fn get(&self, key: &Key) -> Option<InternalEntry> {
            self.0.get(key).map(|entry| entry.clone())
        }

        fn put(&self, key: Key, value: Value, version: EntryVersion) {
            self.0.insert(key, InternalEntry::new(value, version));
        }

        fn remove(&self, key: &Key) {
            self.0.remove(key);
        }
    }

    /// Owns every key except the ones starting with `x`.
    struct Ownership;

    impl OwnershipOracle for Ownership {
        fn current_topology(&self) -> Arc<CacheTopology> {
            Arc::new(CacheTopology::new(1, vec![Address::new("p")]))
        }

        fn owners(&self, _topology: &CacheTopology, keys: &HashSet<Key>) -> Option<HashSet<Address>> {
            if keys.iter().any(|key| key.as_bytes().starts_with(b"x")) {
                Some(HashSet::new())
            } else {
                None
            }
        }
    }

    struct Rpc(Address);

    impl RpcTransport for Rpc {
        fn address(&self) -> &Address {
            &self.0
        }

        fn members(&self) -> Vec<Address> {
            vec![self.0.clone(), Address::new("c")]
        }

        fn invoke_remotely(
            &self,
            _recipients: Option<&[Address]>,
            _command: &TxCommand,
            _options: &RpcOptions,
        ) -> Result<HashMap<Address, CommandResponse>, RpcError> {
            Ok(HashMap::new())
        }
    }

    struct Participant {
        handler: RemoteTransactionHandler,
        container: Arc<Container>,
    }

    fn participant(config: TransactionConfig) -> Participant {
        let container = Arc::new(Container::default());
        let table = TransactionTable::new(config, Arc::new(Rpc(Address::new("p"))), 1);
        let handler = RemoteTransactionHandler::new(
            table,
            container.clone(),
            Arc::new(NumericVersionGenerator::new(1)),
            Arc::new(Ownership),
        );
        Participant { handler, container }
    }

    fn gtx(id: u64) -> GlobalTransaction {
        GlobalTransaction::new(Address::new("c"), id)
    }

    fn put(key: &'static str, value: &'static str) -> WriteCommand {
        WriteCommand::Put {
            key: Key::from(key),
            value: Value::from(value),
        }
    }

    fn prepare(id: u64, modifications: Vec<WriteCommand>, seen: &[(&'static str, Option<EntryVersion>)]) -> TxCommand {
        TxCommand::Prepare(PrepareCommand {
            gtx: gtx(id),
            modifications,
            one_phase: false,
            versions_seen: seen.iter().map(|(k, v)| (Key::from(*k), *v)).collect(),
            topology_id: 1,
        })
    }

    fn commit(id: u64, updated_versions: EntryVersionsMap) -> TxCommand {
        TxCommand::Commit(CommitCommand {
            gtx: gtx(id),
            updated_versions,
            topology_id: 1,
        })
    }

    fn completion(id: u64) -> TxCommand {
        TxCommand::TxCompletionNotification {
            gtx: gtx(id),
            topology_id: 1,
        }
    }

    fn stored_version(participant: &Participant, key: &'static str) -> Option<EntryVersion> {
        participant.container.get(&Key::from(key)).map(|e| e.version)
    }

    #[test]
    fn test_prepare_commit_and_release() {
        let p = participant(TransactionConfig::default());
        let response = p
            .handler
            .handle(&prepare(1, vec![put("k", "v1")], &[("k", None)]))
            .unwrap();
        let versions = response.versions().cloned().unwrap();
        assert_eq!(versions.get(&Key::from("k")), Some(&EntryVersion::new(1, 1)));
        let tx = p.handler.table().get_remote_transaction(&gtx(1)).unwrap();
        assert!(tx.is_prepared());
        assert!(stored_version(&p, "k").is_none());

        p.handler.handle(&commit(1, versions)).unwrap();
        assert_eq!(stored_version(&p, "k"), Some(EntryVersion::new(1, 1)));
        assert_eq!(
            p.handler.table().completed_transaction_status(&gtx(1)),
            CompletedTransactionStatus::Committed
        );
        // Locks are held until the completion notification.
        assert!(p.handler.table().contains_remote_tx(&gtx(1)));
        p.handler.handle(&completion(1)).unwrap();
        assert!(!p.handler.table().contains_remote_tx(&gtx(1)));
        assert!(p.handler.table().key_dependencies().is_empty());
    }

    #[test]
    fn test_write_skew_rolls_back_participant() {
        let p = participant(TransactionConfig::default());
        p.container
            .put(Key::from("k"), Value::from("v"), EntryVersion::new(1, 2));

        let err = p
            .handler
            .handle(&prepare(1, vec![put("k", "v1")], &[("k", Some(EntryVersion::new(1, 1)))]))
            .unwrap_err();
        assert!(matches!(err, TransactionError::WriteSkew { ref key, .. } if key == &Key::from("k")));
        assert!(!p.handler.table().contains_remote_tx(&gtx(1)));
        assert_eq!(
            p.handler.table().completed_transaction_status(&gtx(1)),
            CompletedTransactionStatus::Aborted
        );
        assert_eq!(stored_version(&p, "k"), Some(EntryVersion::new(1, 2)));
    }

    #[test]
    fn test_prepare_of_completed_transaction_is_discarded() {
        let p = participant(TransactionConfig::default());
        p.handler
            .handle(&TxCommand::Rollback(RollbackCommand {
                gtx: gtx(1),
                topology_id: 1,
            }))
            .unwrap();
        let response = p
            .handler
            .handle(&prepare(1, vec![put("k", "v")], &[]))
            .unwrap();
        assert_eq!(response, CommandResponse::Discarded);
        assert_eq!(p.handler.table().remote_tx_count(), 0);
    }

    #[test]
    fn test_one_phase_prepare_commits_immediately() {
        let p = participant(TransactionConfig::default());
        let mut command = prepare(1, vec![put("k", "v"), put("x-remote", "v")], &[]);
        if let TxCommand::Prepare(cmd) = &mut command {
            cmd.one_phase = true;
        }
        p.handler.handle(&command).unwrap();
        assert_eq!(stored_version(&p, "k"), Some(EntryVersion::new(1, 1)));
        // Not owned here.
        assert!(stored_version(&p, "x-remote").is_none());
        assert_eq!(p.handler.table().remote_tx_count(), 0);
    }

    #[test]
    fn test_coordinator_versions_win_on_commit() {
        let p = participant(TransactionConfig::default());
        p.handler
            .handle(&prepare(1, vec![put("k", "v")], &[]))
            .unwrap();
        let asserted: EntryVersionsMap = [(Key::from("k"), Some(EntryVersion::new(1, 7)))]
            .into_iter()
            .collect();
        p.handler.handle(&commit(1, asserted)).unwrap();
        assert_eq!(stored_version(&p, "k"), Some(EntryVersion::new(1, 7)));
    }

    #[test]
    fn test_rolled_back_record_rejects_prepare() {
        let p = participant(TransactionConfig::default());
        let tx = p
            .handler
            .table()
            .get_or_create_remote_transaction(&gtx(1), None, 1);
        tx.mark_for_rollback();
        let err = p
            .handler
            .handle(&prepare(1, vec![put("k", "v")], &[]))
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidTransaction(_)));
        assert!(tx.lookup_entry(&Key::from("k")).is_none());
    }

    #[test]
    fn test_missing_entries_are_repopulated_before_commit() {
        let p = participant(TransactionConfig::default());
        p.handler
            .handle(&prepare(1, vec![put("k", "v")], &[]))
            .unwrap();
        let tx = p.handler.table().get_remote_transaction(&gtx(1)).unwrap();
        tx.clear_looked_up_entries();
        tx.set_missing_looked_up_entries(true);

        p.handler
            .handle(&commit(1, EntryVersionsMap::new()))
            .unwrap();
        assert!(!tx.is_missing_looked_up_entries());
        assert!(p.container.get(&Key::from("k")).is_some());
    }

    #[test]
    fn test_conflicting_prepare_waits_then_fails_validation() {
        let p = participant(TransactionConfig::default());
        p.container
            .put(Key::from("k"), Value::from("v0"), EntryVersion::new(1, 1));
        let v0 = Some(EntryVersion::new(1, 1));
        let first = p
            .handler
            .handle(&prepare(1, vec![put("k", "a")], &[("k", v0)]))
            .unwrap();

        thread::scope(|s| {
            let second = s.spawn(|| {
                p.handler
                    .handle(&prepare(2, vec![put("k", "b")], &[("k", v0)]))
            });
            thread::sleep(Duration::from_millis(20));
            p.handler
                .handle(&commit(1, first.versions().cloned().unwrap()))
                .unwrap();
            p.handler.handle(&completion(1)).unwrap();

            let err = second.join().unwrap().unwrap_err();
            assert!(matches!(err, TransactionError::WriteSkew { .. }));
        });
        assert_eq!(stored_version(&p, "k"), Some(EntryVersion::new(1, 2)));
    }

    #[test]
    fn test_conflicting_prepare_times_out() {
        let p = participant(
            TransactionConfig::default().with_lock_acquisition_timeout(Duration::from_millis(20)),
        );
        p.handler
            .handle(&prepare(1, vec![put("k", "a")], &[]))
            .unwrap();
        let err = p
            .handler
            .handle(&prepare(2, vec![put("k", "b")], &[]))
            .unwrap_err();
        assert!(matches!(err, TransactionError::Timeout { .. }));
        assert!(p.handler.table().contains_remote_tx(&gtx(1)));
        assert!(!p.handler.table().contains_remote_tx(&gtx(2)));
    }

    #[test]
    fn test_total_order_commit_before_prepare() {
        let p = participant(
            TransactionConfig::default().with_protocol(TransactionProtocol::TotalOrder),
        );
        let versions: EntryVersionsMap = [(Key::from("k"), Some(EntryVersion::new(1, 4)))]
            .into_iter()
            .collect();
        p.handler.handle(&commit(1, versions)).unwrap();
        assert!(stored_version(&p, "k").is_none());

        p.handler
            .handle(&prepare(1, vec![put("k", "v")], &[]))
            .unwrap();
        assert_eq!(stored_version(&p, "k"), Some(EntryVersion::new(1, 4)));
        assert_eq!(p.handler.table().remote_tx_count(), 0);
    }

    #[test]
    fn test_total_order_rollback_before_prepare() {
        let p = participant(
            TransactionConfig::default().with_protocol(TransactionProtocol::TotalOrder),
        );
        p.handler
            .handle(&TxCommand::Rollback(RollbackCommand {
                gtx: gtx(1),
                topology_id: 1,
            }))
            .unwrap();
        let response = p
            .handler
            .handle(&prepare(1, vec![put("k", "v")], &[]))
            .unwrap();
        assert_eq!(response, CommandResponse::Discarded);
        assert_eq!(p.handler.table().remote_tx_count(), 0);
        assert!(stored_version(&p, "k").is_none());
    }

    #[test]
    fn test_total_order_prepare_records_placeholders() {
        let p = participant(
            TransactionConfig::default().with_protocol(TransactionProtocol::TotalOrder),
        );
        let response = p
            .handler
            .handle(&prepare(1, vec![put("k", "v")], &[]))
            .unwrap();
        assert_eq!(response.versions().unwrap().lookup(&Key::from("k")), Some(None));

        p.handler
            .handle(&commit(1, response.versions().cloned().unwrap()))
            .unwrap();
        // No version was asserted, a fresh one is generated.
        assert_eq!(stored_version(&p, "k"), Some(EntryVersion::new(1, 1)));
        assert_eq!(p.handler.table().remote_tx_count(), 0);
    }
}
