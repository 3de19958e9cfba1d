use std::time::Duration;

use gridtx_common::{Address, GlobalTransaction, IdError, Key};
use miette::Diagnostic;
use thiserror::Error;

pub type TransactionResult<T> = Result<T, TransactionError>;

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Error, Debug, Diagnostic)]
pub enum TransactionError {
    #[error("transaction {0} is already prepared, its modifications are immutable")]
    AlreadyPrepared(GlobalTransaction),

    #[error("transaction {0} was rolled back and cannot accept entry writes")]
    InvalidTransaction(GlobalTransaction),

    #[error("write skew detected on key {key} for transaction {gtx}")]
    WriteSkew { key: Key, gtx: GlobalTransaction },

    #[error("transaction {0} is not registered")]
    NotFound(GlobalTransaction),

    #[error("transaction {gtx} timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        gtx: GlobalTransaction,
        timeout: Duration,
        waiting_for: &'static str,
    },

    #[error("remote invocation failed")]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Id(#[from] IdError),

    #[error("failed to build worker pool")]
    Executor(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to spawn background thread")]
    Io(#[from] std::io::Error),
}

impl TransactionError {
    /// The key that failed the write-skew check, looking through remote failures.
    pub fn write_skew_key(&self) -> Option<&Key> {
        match self {
            TransactionError::WriteSkew { key, .. } => Some(key),
            TransactionError::Rpc(RpcError::Remote { source, .. }) => source.write_skew_key(),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum RpcError {
    #[error("node {0} is unreachable")]
    Unreachable(Address),

    #[error("timed out after {0:?} waiting for responses")]
    Timeout(Duration),

    #[error("node {address} failed to process the command")]
    Remote {
        address: Address,
        #[source]
        source: Box<TransactionError>,
    },
}

/// Failures reported to callers of the coordinator.
///
/// Expected outcomes such as read-only or rollback-only are not errors; see
/// [`crate::PrepareOutcome`] and [`crate::CommitOutcome`].
#[derive(Error, Debug, Diagnostic)]
pub enum CoordinatorError {
    #[error("write skew detected on key {key} while preparing {gtx}")]
    WriteSkew {
        gtx: GlobalTransaction,
        key: Key,
        #[source]
        source: TransactionError,
    },

    #[error("resource manager error while completing {gtx}")]
    #[diagnostic(help("the outcome was not retried, the transaction manager decides what to do next"))]
    ResourceManager {
        gtx: GlobalTransaction,
        #[source]
        source: TransactionError,
    },

    #[error("outcome of {gtx} is uncertain, rollback failed")]
    #[diagnostic(help("some participants may have rolled back while others have not"))]
    HeuristicHazard {
        gtx: GlobalTransaction,
        #[source]
        source: TransactionError,
    },
}

impl CoordinatorError {
    /// Classifies a failure of prepare or one-phase commit.
    pub(crate) fn from_dispatch(gtx: GlobalTransaction, source: TransactionError) -> Self {
        match source.write_skew_key().cloned() {
            Some(key) => CoordinatorError::WriteSkew { gtx, key, source },
            None => CoordinatorError::ResourceManager { gtx, source },
        }
    }

    pub fn global_transaction(&self) -> &GlobalTransaction {
        match self {
            CoordinatorError::WriteSkew { gtx, .. }
            | CoordinatorError::ResourceManager { gtx, .. }
            | CoordinatorError::HeuristicHazard { gtx, .. } => gtx,
        }
    }
}
