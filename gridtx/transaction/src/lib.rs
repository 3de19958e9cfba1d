//! Distributed transaction coordination for the gridtx data grid.
//!
//! The crate tracks every in-flight transaction of a node, both the ones it originated
//! ([`LocalTransaction`]) and the ones it participates in on behalf of another member
//! ([`RemoteTransaction`]). It drives two-phase commit through an external [`CommandPipeline`]
//! and detects write skew under optimistic locking.
//!
//! Routing, transport and storage are collaborators described by the traits in [`spi`]; the
//! crate never talks to the network or the data container directly.

pub mod clustered;
pub mod command;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod latch;
mod reaper;
pub mod record;
pub mod remote_handler;
pub mod spi;
pub mod table;
pub mod write_skew;

pub use clustered::ClusteredTransactionCoordinator;
pub use command::{CommandResponse, TxCommand, WriteCommand};
pub use config::{LockingMode, TransactionConfig, TransactionProtocol};
pub use context::{InvocationContextContainer, TxInvocationContext};
pub use coordinator::{CommitOutcome, PrepareOutcome, TransactionCoordinator};
pub use entry::{InternalEntry, MvccEntry};
pub use error::{
    CoordinatorError, CoordinatorResult, RpcError, TransactionError, TransactionResult,
};
pub use latch::{KeyDependencyTracker, LatchWait, TxDependencyLatch};
pub use record::{CacheTransaction, LocalTransaction, RemoteTransaction, TransactionHandle};
pub use remote_handler::RemoteTransactionHandler;
pub use spi::{CommandPipeline, DataContainer, OwnershipOracle, RpcOptions, RpcTransport};
pub use table::{CompletedTransactionStatus, TransactionTable};
