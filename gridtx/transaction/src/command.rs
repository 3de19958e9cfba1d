//! Commands the coordinator pushes through the [`CommandPipeline`](crate::CommandPipeline).

use std::collections::HashSet;

use gridtx_common::{EntryVersionsMap, GlobalTransaction, Key, TopologyId, Value};
use serde::{Deserialize, Serialize};

/// A single write recorded by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteCommand {
    Put { key: Key, value: Value },
    Remove { key: Key },
    PutAll { entries: Vec<(Key, Value)> },
}

impl WriteCommand {
    /// Keys this write touches.
    pub fn affected_keys(&self) -> Vec<&Key> {
        match self {
            WriteCommand::Put { key, .. } | WriteCommand::Remove { key } => vec![key],
            WriteCommand::PutAll { entries } => entries.iter().map(|(key, _)| key).collect(),
        }
    }
}

/// Collects the keys touched by a list of writes.
pub fn affected_keys_of(modifications: &[WriteCommand]) -> HashSet<Key> {
    modifications
        .iter()
        .flat_map(WriteCommand::affected_keys)
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareCommand {
    pub gtx: GlobalTransaction,
    pub modifications: Vec<WriteCommand>,
    /// Prepare and commit in a single round.
    pub one_phase: bool,
    /// Versions the transaction read, validated by the write-skew check.
    pub versions_seen: EntryVersionsMap,
    pub topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCommand {
    pub gtx: GlobalTransaction,
    /// New versions computed while preparing.
    pub updated_versions: EntryVersionsMap,
    pub topology_id: TopologyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackCommand {
    pub gtx: GlobalTransaction,
    pub topology_id: TopologyId,
}

/// Protocol commands, keyed by the transaction they act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxCommand {
    Prepare(PrepareCommand),
    Commit(CommitCommand),
    Rollback(RollbackCommand),
    /// Tells the owners that the transaction finished and its locks can be released.
    TxCompletionNotification {
        gtx: GlobalTransaction,
        topology_id: TopologyId,
    },
}

impl TxCommand {
    pub fn global_transaction(&self) -> &GlobalTransaction {
        match self {
            TxCommand::Prepare(cmd) => &cmd.gtx,
            TxCommand::Commit(cmd) => &cmd.gtx,
            TxCommand::Rollback(cmd) => &cmd.gtx,
            TxCommand::TxCompletionNotification { gtx, .. } => gtx,
        }
    }

    pub fn topology_id(&self) -> TopologyId {
        match self {
            TxCommand::Prepare(cmd) => cmd.topology_id,
            TxCommand::Commit(cmd) => cmd.topology_id,
            TxCommand::Rollback(cmd) => cmd.topology_id,
            TxCommand::TxCompletionNotification { topology_id, .. } => *topology_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxCommand::Prepare(cmd) if cmd.one_phase => "prepare(1pc)",
            TxCommand::Prepare(_) => "prepare",
            TxCommand::Commit(_) => "commit",
            TxCommand::Rollback(_) => "rollback",
            TxCommand::TxCompletionNotification { .. } => "tx-completion",
        }
    }
}

/// What a participant answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    #[default]
    Unit,
    /// New versions computed by the write-skew check.
    Versions(EntryVersionsMap),
    /// The command targeted a transaction that already completed and was ignored.
    Discarded,
}

impl CommandResponse {
    pub fn versions(&self) -> Option<&EntryVersionsMap> {
        match self {
            CommandResponse::Versions(versions) => Some(versions),
            _ => None,
        }
    }
}
