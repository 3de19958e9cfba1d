//! Drives two-phase commit for transactions originated on this node.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::command::{CommitCommand, PrepareCommand, RollbackCommand, TxCommand};
use crate::config::TransactionConfig;
use crate::context::{InvocationContextContainer, TxInvocationContext};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::record::{CacheTransaction, LocalTransaction};
use crate::spi::CommandPipeline;
use crate::table::TransactionTable;

/// Expected results of [`TransactionCoordinator::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Participants voted yes; the transaction waits for commit.
    Prepared,
    /// Nothing was written. The transaction is already cleaned up, no commit follows.
    ReadOnly,
    /// The transaction was marked for rollback before any work was dispatched.
    RollbackOnly,
}

/// Expected results of [`TransactionCoordinator::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The commit was handed to a background executor.
    Deferred,
    /// The transaction was marked for rollback. A prepared transaction is rolled back on its
    /// participants, otherwise nothing was dispatched.
    RollbackOnly,
}

/// Clears the calling thread's transaction association on drop.
struct InvocationScope<'a> {
    contexts: &'a InvocationContextContainer,
}

impl<'a> InvocationScope<'a> {
    fn enter(contexts: &'a InvocationContextContainer, tx: &LocalTransaction) -> Self {
        contexts.associate(tx.global_transaction().clone());
        Self { contexts }
    }
}

impl Drop for InvocationScope<'_> {
    fn drop(&mut self) {
        self.contexts.suspend();
    }
}

/// Unregisters a finishing transaction on every exit path.
struct CompletionGuard<'a> {
    table: &'a TransactionTable,
    tx: &'a LocalTransaction,
    _scope: InvocationScope<'a>,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        let removed = self.table.remove_local_transaction(self.tx);
        trace!(gtx = %self.tx.global_transaction(), removed, "released local transaction");
    }
}

pub struct TransactionCoordinator {
    table: Arc<TransactionTable>,
    pipeline: Arc<dyn CommandPipeline>,
    contexts: Arc<InvocationContextContainer>,
}

impl TransactionCoordinator {
    pub fn new(
        table: Arc<TransactionTable>,
        pipeline: Arc<dyn CommandPipeline>,
        contexts: Arc<InvocationContextContainer>,
    ) -> Self {
        Self {
            table,
            pipeline,
            contexts,
        }
    }

    #[inline]
    pub fn config(&self) -> &TransactionConfig {
        self.table.config()
    }

    #[inline]
    pub fn table(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    #[inline]
    pub fn contexts(&self) -> &Arc<InvocationContextContainer> {
        &self.contexts
    }

    fn completion_guard<'a>(&'a self, tx: &'a LocalTransaction) -> CompletionGuard<'a> {
        CompletionGuard {
            table: &self.table,
            tx,
            _scope: InvocationScope::enter(&self.contexts, tx),
        }
    }

    /// Runs the first phase.
    ///
    /// Failures are never retried here; the caller decides whether to roll back.
    pub fn prepare(&self, tx: &Arc<LocalTransaction>) -> CoordinatorResult<PrepareOutcome> {
        let gtx = tx.global_transaction();
        if tx.is_marked_for_rollback() {
            trace!(%gtx, "transaction marked for rollback, refusing to prepare");
            return Ok(PrepareOutcome::RollbackOnly);
        }
        if self.config().use_one_phase_commit {
            trace!(%gtx, "one-phase commit configured, skipping prepare");
            return Ok(PrepareOutcome::Prepared);
        }
        if tx.is_read_only() {
            trace!(%gtx, "read-only transaction, nothing to prepare");
            drop(self.completion_guard(tx));
            return Ok(PrepareOutcome::ReadOnly);
        }

        let _scope = InvocationScope::enter(&self.contexts, tx);
        let command = TxCommand::Prepare(PrepareCommand {
            gtx: gtx.clone(),
            modifications: tx.modifications(),
            one_phase: false,
            versions_seen: tx.versions_seen(),
            topology_id: tx.topology_id(),
        });
        let ctx = TxInvocationContext::new(Arc::clone(tx));
        trace!(%gtx, "dispatching prepare");
        match self.pipeline.invoke(&ctx, &command) {
            Ok(response) => {
                if let Some(versions) = response.versions() {
                    tx.merge_updated_versions(versions);
                }
            }
            Err(source) => {
                warn!(%gtx, error = %source, "prepare failed");
                return Err(CoordinatorError::from_dispatch(gtx.clone(), source));
            }
        }

        if tx.is_read_only() {
            trace!(%gtx, "transaction turned out read-only, cleaning up");
            drop(self.completion_guard(tx));
            return Ok(PrepareOutcome::ReadOnly);
        }
        tx.mark_prepared();
        trace!(%gtx, "transaction prepared");
        Ok(PrepareOutcome::Prepared)
    }

    /// Runs the second phase, or prepare and commit at once when `one_phase` is set or
    /// configured. The transaction is unregistered whatever the outcome.
    pub fn commit(
        &self,
        tx: &Arc<LocalTransaction>,
        one_phase: bool,
    ) -> CoordinatorResult<CommitOutcome> {
        let _guard = self.completion_guard(tx);
        let gtx = tx.global_transaction();
        if tx.is_marked_for_rollback() {
            if tx.is_prepared() {
                trace!(%gtx, "prepared transaction marked for rollback, rolling back participants");
                self.dispatch_rollback(tx)?;
            } else {
                trace!(%gtx, "transaction marked for rollback, refusing to commit");
            }
            return Ok(CommitOutcome::RollbackOnly);
        }
        if tx.is_read_only() {
            trace!(%gtx, "read-only transaction, nothing to commit");
            return Ok(CommitOutcome::Committed);
        }

        let one_phase = one_phase || self.config().use_one_phase_commit;
        let command = if one_phase {
            TxCommand::Prepare(PrepareCommand {
                gtx: gtx.clone(),
                modifications: tx.modifications(),
                one_phase: true,
                versions_seen: tx.versions_seen(),
                topology_id: tx.topology_id(),
            })
        } else {
            TxCommand::Commit(CommitCommand {
                gtx: gtx.clone(),
                updated_versions: tx.updated_versions().unwrap_or_default(),
                topology_id: tx.topology_id(),
            })
        };
        let ctx = TxInvocationContext::new(Arc::clone(tx));
        trace!(%gtx, command = command.name(), "dispatching commit");
        match self.pipeline.invoke(&ctx, &command) {
            Ok(_) => Ok(CommitOutcome::Committed),
            Err(source) if one_phase => {
                warn!(%gtx, error = %source, "one-phase commit failed");
                Err(CoordinatorError::from_dispatch(gtx.clone(), source))
            }
            Err(source) => {
                warn!(%gtx, error = %source, "commit failed");
                Err(CoordinatorError::ResourceManager {
                    gtx: gtx.clone(),
                    source,
                })
            }
        }
    }

    /// Rolls back everywhere. The transaction is unregistered whatever the outcome; a failed
    /// rollback leaves the outcome uncertain.
    pub fn rollback(&self, tx: &Arc<LocalTransaction>) -> CoordinatorResult<()> {
        let _guard = self.completion_guard(tx);
        self.dispatch_rollback(tx)
    }

    fn dispatch_rollback(&self, tx: &Arc<LocalTransaction>) -> CoordinatorResult<()> {
        let gtx = tx.global_transaction();
        let command = TxCommand::Rollback(RollbackCommand {
            gtx: gtx.clone(),
            topology_id: tx.topology_id(),
        });
        let ctx = TxInvocationContext::new(Arc::clone(tx));
        trace!(%gtx, "dispatching rollback");
        self.pipeline
            .invoke(&ctx, &command)
            .map(|_| ())
            .map_err(|source| {
                warn!(%gtx, error = %source, "rollback failed");
                CoordinatorError::HeuristicHazard {
                    gtx: gtx.clone(),
                    source,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use gridtx_common::{Address, EntryVersion, EntryVersionsMap, Key, Value};
    use parking_lot::Mutex;

    use super::*;
    use crate::command::{CommandResponse, WriteCommand};
    use crate::error::{RpcError, TransactionError, TransactionResult};
    use crate::record::TransactionHandle;
    use crate::spi::{RpcOptions, RpcTransport};

    struct Loopback(Address);

    impl RpcTransport for Loopback {
        fn address(&self) -> &Address {
            &self.0
        }

        fn members(&self) -> Vec<Address> {
            vec![self.0.clone()]
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

    /// Records dispatched commands and fails the ones named in `fail`.
    #[derive(Default)]
    struct RecordingPipeline {
        invoked: Mutex<Vec<TxCommand>>,
        fail: Vec<&'static str>,
        response: CommandResponse,
    }

    impl RecordingPipeline {
        fn failing(fail: Vec<&'static str>) -> Self {
            Self {
                fail,
                ..Default::default()
            }
        }

        fn names(&self) -> Vec<&'static str> {
            self.invoked.lock().iter().map(TxCommand::name).collect()
        }
    }

    impl CommandPipeline for RecordingPipeline {
        fn invoke(
            &self,
            ctx: &TxInvocationContext,
            command: &TxCommand,
        ) -> TransactionResult<CommandResponse> {
            assert_eq!(ctx.global_transaction(), command.global_transaction());
            self.invoked.lock().push(command.clone());
            match command.name() {
                name if self.fail.contains(&name) => match command {
                    TxCommand::Prepare(_) => Err(TransactionError::WriteSkew {
                        key: Key::from("k"),
                        gtx: command.global_transaction().clone(),
                    }),
                    _ => Err(TransactionError::Rpc(RpcError::Unreachable(Address::new("b")))),
                },
                _ => Ok(self.response.clone()),
            }
        }
    }

    fn coordinator(
        config: TransactionConfig,
        pipeline: Arc<RecordingPipeline>,
    ) -> TransactionCoordinator {
        let table = TransactionTable::new(config, Arc::new(Loopback(Address::new("a"))), 1);
        TransactionCoordinator::new(table, pipeline, Arc::new(InvocationContextContainer::new()))
    }

    fn writing_tx(coordinator: &TransactionCoordinator, handle: u64) -> Arc<LocalTransaction> {
        let tx = coordinator
            .table()
            .get_or_create_local_transaction(TransactionHandle::new(handle), false)
            .unwrap();
        tx.add_modification(WriteCommand::Put {
            key: Key::from("k"),
            value: Value::from("v"),
        })
        .unwrap();
        tx
    }

    fn assert_cleaned_up(coordinator: &TransactionCoordinator, tx: &LocalTransaction) {
        assert!(!coordinator.table().contains_local_tx(tx.global_transaction()));
        assert_eq!(coordinator.contexts().current(), None);
        assert!(tx.latch().is_released());
    }

    #[test]
    fn test_two_phase_commit() {
        let versions: EntryVersionsMap = [(Key::from("k"), Some(EntryVersion::new(1, 1)))]
            .into_iter()
            .collect();
        let pipeline = Arc::new(RecordingPipeline {
            response: CommandResponse::Versions(versions.clone()),
            ..Default::default()
        });
        let coordinator = coordinator(TransactionConfig::default(), pipeline.clone());
        let tx = writing_tx(&coordinator, 1);

        assert_eq!(coordinator.prepare(&tx).unwrap(), PrepareOutcome::Prepared);
        assert!(tx.is_prepared());
        assert!(coordinator.table().contains_local_tx(tx.global_transaction()));
        assert_eq!(coordinator.contexts().current(), None);

        assert_eq!(coordinator.commit(&tx, false).unwrap(), CommitOutcome::Committed);
        assert_eq!(pipeline.names(), vec!["prepare", "commit"]);
        match &pipeline.invoked.lock()[1] {
            TxCommand::Commit(commit) => assert_eq!(commit.updated_versions, versions),
            other => panic!("unexpected command {other:?}"),
        }
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_read_only_prepare_dispatches_nothing() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let coordinator = coordinator(TransactionConfig::default(), pipeline.clone());
        let tx = coordinator
            .table()
            .get_or_create_local_transaction(TransactionHandle::new(1), false)
            .unwrap();

        assert_eq!(coordinator.prepare(&tx).unwrap(), PrepareOutcome::ReadOnly);
        assert!(pipeline.names().is_empty());
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_configured_one_phase_commit_sends_single_prepare() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let coordinator = coordinator(
            TransactionConfig::default().with_one_phase_commit(true),
            pipeline.clone(),
        );
        let tx = writing_tx(&coordinator, 1);

        assert_eq!(coordinator.prepare(&tx).unwrap(), PrepareOutcome::Prepared);
        assert!(pipeline.names().is_empty());
        assert_eq!(coordinator.commit(&tx, false).unwrap(), CommitOutcome::Committed);
        assert_eq!(pipeline.names(), vec!["prepare(1pc)"]);
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_one_phase_failure_still_cleans_up() {
        let pipeline = Arc::new(RecordingPipeline::failing(vec!["prepare(1pc)"]));
        let coordinator = coordinator(TransactionConfig::default(), pipeline.clone());
        let tx = writing_tx(&coordinator, 1);

        let err = coordinator.commit(&tx, true).unwrap_err();
        assert!(matches!(err, CoordinatorError::WriteSkew { .. }));
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_commit_failure_is_resource_manager_error() {
        let pipeline = Arc::new(RecordingPipeline::failing(vec!["commit"]));
        let coordinator = coordinator(TransactionConfig::default(), pipeline);
        let tx = writing_tx(&coordinator, 1);
        coordinator.prepare(&tx).unwrap();

        let err = coordinator.commit(&tx, false).unwrap_err();
        assert!(matches!(err, CoordinatorError::ResourceManager { .. }));
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_prepare_failure_is_reported_and_not_retried() {
        let pipeline = Arc::new(RecordingPipeline::failing(vec!["prepare"]));
        let coordinator = coordinator(TransactionConfig::default(), pipeline.clone());
        let tx = writing_tx(&coordinator, 1);

        let err = coordinator.prepare(&tx).unwrap_err();
        assert!(matches!(err, CoordinatorError::WriteSkew { ref key, .. } if key == &Key::from("k")));
        assert_eq!(pipeline.names(), vec!["prepare"]);
        assert!(!tx.is_prepared());
        // Still registered, the caller rolls back.
        assert!(coordinator.table().contains_local_tx(tx.global_transaction()));
    }

    #[test]
    fn test_failed_rollback_is_heuristic_hazard() {
        let pipeline = Arc::new(RecordingPipeline::failing(vec!["rollback"]));
        let coordinator = coordinator(TransactionConfig::default(), pipeline);
        let tx = writing_tx(&coordinator, 1);

        let err = coordinator.rollback(&tx).unwrap_err();
        assert!(matches!(err, CoordinatorError::HeuristicHazard { .. }));
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_rollback_only_is_terminal() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let coordinator = coordinator(TransactionConfig::default(), pipeline.clone());
        let tx = writing_tx(&coordinator, 1);
        tx.mark_for_rollback();

        assert_eq!(coordinator.prepare(&tx).unwrap(), PrepareOutcome::RollbackOnly);
        assert_eq!(coordinator.commit(&tx, false).unwrap(), CommitOutcome::RollbackOnly);
        assert_eq!(coordinator.commit(&tx, true).unwrap(), CommitOutcome::RollbackOnly);
        assert!(pipeline.names().is_empty());
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_marked_after_prepare_rolls_back_participants() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let coordinator = coordinator(TransactionConfig::default(), pipeline.clone());
        let tx = writing_tx(&coordinator, 1);
        assert_eq!(coordinator.prepare(&tx).unwrap(), PrepareOutcome::Prepared);
        tx.mark_for_rollback();

        assert_eq!(coordinator.commit(&tx, false).unwrap(), CommitOutcome::RollbackOnly);
        assert_eq!(pipeline.names(), vec!["prepare", "rollback"]);
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_failed_rollback_of_marked_prepared_tx_is_heuristic_hazard() {
        let pipeline = Arc::new(RecordingPipeline::failing(vec!["rollback"]));
        let coordinator = coordinator(TransactionConfig::default(), pipeline);
        let tx = writing_tx(&coordinator, 1);
        coordinator.prepare(&tx).unwrap();
        tx.mark_for_rollback();

        let err = coordinator.commit(&tx, false).unwrap_err();
        assert!(matches!(err, CoordinatorError::HeuristicHazard { .. }));
        assert_cleaned_up(&coordinator, &tx);
    }

    #[test]
    fn test_marked_from_another_thread_is_observed() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let coordinator = coordinator(TransactionConfig::default(), pipeline.clone());
        let tx = writing_tx(&coordinator, 1);
        std::thread::scope(|s| {
            s.spawn(|| tx.mark_for_rollback());
        });
        assert_eq!(coordinator.prepare(&tx).unwrap(), PrepareOutcome::RollbackOnly);
        assert!(pipeline.names().is_empty());
    }
}
