//! Optimistic write-skew validation.
//!
//! Every key written by a transaction is checked against the version the transaction read. If
//! any key moved on in the meantime the whole prepare fails, nothing is partially recorded.

use std::collections::HashSet;

use gridtx_common::{EntryVersionsMap, Key, VersionGenerator};
use tracing::trace;

use crate::command::WriteCommand;
use crate::entry::MvccEntry;
use crate::error::{TransactionError, TransactionResult};
use crate::record::CacheTransaction;
use crate::spi::DataContainer;

/// Validates the write set of `tx` and computes the version each written key receives.
///
/// `should_check` selects the keys validated on this node, usually the locally owned ones.
pub fn perform_write_skew_check(
    tx: &dyn CacheTransaction,
    modifications: &[WriteCommand],
    versions_seen: &EntryVersionsMap,
    container: &dyn DataContainer,
    generator: &dyn VersionGenerator,
    should_check: impl FnMut(&Key) -> bool,
) -> TransactionResult<EntryVersionsMap> {
    validate(
        tx,
        modifications,
        versions_seen,
        container,
        generator,
        should_check,
        true,
    )
}

/// Variant used under total-order delivery: keys are validated but map to no version, since
/// delivery order already arbitrates conflicts.
pub fn perform_total_order_write_skew_check(
    tx: &dyn CacheTransaction,
    modifications: &[WriteCommand],
    versions_seen: &EntryVersionsMap,
    container: &dyn DataContainer,
    generator: &dyn VersionGenerator,
    should_check: impl FnMut(&Key) -> bool,
) -> TransactionResult<EntryVersionsMap> {
    validate(
        tx,
        modifications,
        versions_seen,
        container,
        generator,
        should_check,
        false,
    )
}

fn validate(
    tx: &dyn CacheTransaction,
    modifications: &[WriteCommand],
    versions_seen: &EntryVersionsMap,
    container: &dyn DataContainer,
    generator: &dyn VersionGenerator,
    mut should_check: impl FnMut(&Key) -> bool,
    compute_versions: bool,
) -> TransactionResult<EntryVersionsMap> {
    let gtx = tx.global_transaction();
    let mut versions = EntryVersionsMap::new();
    let mut visited = HashSet::new();

    for key in modifications.iter().flat_map(WriteCommand::affected_keys) {
        if !visited.insert(key) || !should_check(key) {
            continue;
        }
        let entry = tx
            .lookup_entry(key)
            .unwrap_or_else(|| MvccEntry::read(key.clone(), None));
        let seen = versions_seen.lookup(key);

        if !entry.perform_write_skew_check(container, seen, generator) {
            trace!(%gtx, %key, "write skew detected");
            return Err(TransactionError::WriteSkew {
                key: key.clone(),
                gtx: gtx.clone(),
            });
        }

        if !compute_versions {
            versions.insert(key.clone(), None);
            continue;
        }
        let new_version = match container.get(key) {
            None => generator.generate_new(),
            Some(stored) => generator.increment(&stored.version)?,
        };
        trace!(%gtx, %key, ?new_version, "write skew check passed");
        versions.insert(key.clone(), Some(new_version));
    }
    Ok(versions)
}
