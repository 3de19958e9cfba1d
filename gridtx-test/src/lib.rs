//! In-process cluster used to exercise the transaction engine end to end.
//!
//! Every member gets its own [`TransactionTable`](gridtx_transaction::TransactionTable),
//! coordinator, participant handler and [`MemoryDataContainer`]. Members talk over a shared
//! [`Network`] that applies commands synchronously on the sender's thread.

mod cluster;
mod container;
mod network;
mod ownership;
mod pipeline;

pub use cluster::{Cluster, ClusterBuilder, Node};
pub use container::MemoryDataContainer;
pub use network::{Network, Transport};
pub use ownership::StaticOwnership;
pub use pipeline::ClusterPipeline;
