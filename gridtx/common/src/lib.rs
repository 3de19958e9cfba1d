//! Value types shared across the gridtx crates.
//!
//! Nothing in here has behavior beyond bookkeeping: node addresses, cache keys and values,
//! cluster-unique transaction identifiers, entry versions and topology snapshots.

pub mod address;
pub mod error;
pub mod gtx;
pub mod key;
pub mod topology;
pub mod version;

pub use address::Address;
pub use error::IdError;
pub use gtx::{GlobalTransaction, TransactionIdGenerator};
pub use key::{Key, Value};
pub use topology::{CacheTopology, TopologyChangedEvent, TopologyId};
pub use version::{
    EntryVersion, EntryVersionsMap, NumericVersionGenerator, VersionGenerator, VersionOrdering,
};
