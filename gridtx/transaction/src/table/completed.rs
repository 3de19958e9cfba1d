use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gridtx_common::{Address, GlobalTransaction};
use tracing::trace;

/// What the registry remembers about a transaction after it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedTransactionStatus {
    NotCompleted,
    Committed,
    Aborted,
    /// Completed long enough ago that the outcome was pruned.
    Expired,
}

#[derive(Debug, Clone, Copy)]
struct CompletedInfo {
    completed_at: Instant,
    committed: bool,
}

/// Outcomes of recently finished transactions.
///
/// Ids are allocated in sequence per originator, so once an entry is pruned any id up to the
/// pruned one still answers "completed" through the per-node watermark.
#[derive(Debug, Default)]
pub(crate) struct CompletedTransactions {
    completed: DashMap<GlobalTransaction, CompletedInfo>,
    /// Highest pruned id of any originator, 0 while nothing was pruned.
    global_max_pruned_id: AtomicU64,
    node_max_pruned_ids: DashMap<Address, u64>,
}

impl CompletedTransactions {
    pub(crate) fn mark_completed(&self, gtx: GlobalTransaction, committed: bool, now: Instant) {
        self.completed.insert(
            gtx,
            CompletedInfo {
                completed_at: now,
                committed,
            },
        );
    }

    pub(crate) fn is_completed(&self, gtx: &GlobalTransaction) -> bool {
        if self.completed.contains_key(gtx) {
            return true;
        }
        // Only consult the watermarks after the map.
        if gtx.id() > self.global_max_pruned_id.load(Ordering::Acquire) {
            return false;
        }
        self.node_max_pruned_ids
            .get(gtx.address())
            .is_some_and(|max| gtx.id() <= *max)
    }

    pub(crate) fn status(&self, gtx: &GlobalTransaction) -> CompletedTransactionStatus {
        if let Some(info) = self.completed.get(gtx) {
            return if info.committed {
                CompletedTransactionStatus::Committed
            } else {
                CompletedTransactionStatus::Aborted
            };
        }
        if gtx.id() > self.global_max_pruned_id.load(Ordering::Acquire) {
            return CompletedTransactionStatus::NotCompleted;
        }
        match self.node_max_pruned_ids.get(gtx.address()) {
            Some(max) if gtx.id() <= *max => CompletedTransactionStatus::Expired,
            _ => CompletedTransactionStatus::NotCompleted,
        }
    }

    /// Prunes entries completed more than `timeout` before `now`. Watermarks of originators
    /// that are no longer `members` and have nothing left in the map are dropped.
    pub(crate) fn cleanup(&self, now: Instant, timeout: Duration, members: &[Address]) -> usize {
        if self.completed.is_empty() {
            return 0;
        }
        let mut leavers: HashSet<Address> = self
            .node_max_pruned_ids
            .iter()
            .filter(|entry| !members.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = Vec::new();
        for entry in self.completed.iter() {
            if now.saturating_duration_since(entry.completed_at) > timeout {
                expired.push(entry.key().clone());
            } else {
                leavers.remove(entry.key().address());
            }
        }

        for gtx in &expired {
            // Watermarks move before the entry disappears.
            self.update_last_pruned_id(gtx);
            self.completed.remove(gtx);
        }
        for leaver in &leavers {
            self.node_max_pruned_ids.remove(leaver);
        }

        trace!(
            removed = expired.len(),
            remaining = self.completed.len(),
            global_max_pruned_id = self.global_max_pruned_id.load(Ordering::Acquire),
            "cleaned up completed transactions"
        );
        expired.len()
    }

    fn update_last_pruned_id(&self, gtx: &GlobalTransaction) {
        self.global_max_pruned_id
            .fetch_max(gtx.id(), Ordering::AcqRel);
        self.node_max_pruned_ids
            .entry(gtx.address().clone())
            .and_modify(|max| *max = (*max).max(gtx.id()))
            .or_insert(gtx.id());
    }

    pub(crate) fn len(&self) -> usize {
        self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gtx(node: &str, id: u64) -> GlobalTransaction {
        GlobalTransaction::new(Address::new(node), id)
    }

    #[test]
    fn test_pruned_transactions_expire() {
        let completed = CompletedTransactions::default();
        let start = Instant::now();
        completed.mark_completed(gtx("a", 1), true, start);
        completed.mark_completed(gtx("a", 2), false, start);
        completed.mark_completed(gtx("b", 5), true, start + Duration::from_secs(50));

        assert_eq!(completed.status(&gtx("a", 1)), CompletedTransactionStatus::Committed);
        assert_eq!(completed.status(&gtx("a", 2)), CompletedTransactionStatus::Aborted);

        let members = [Address::new("a"), Address::new("b")];
        let removed = completed.cleanup(
            start + Duration::from_secs(61),
            Duration::from_secs(60),
            &members,
        );
        assert_eq!(removed, 2);
        assert_eq!(completed.len(), 1);

        assert!(completed.is_completed(&gtx("a", 1)));
        assert_eq!(completed.status(&gtx("a", 2)), CompletedTransactionStatus::Expired);
        assert_eq!(completed.status(&gtx("a", 3)), CompletedTransactionStatus::NotCompleted);
        // Below the global watermark but nothing was pruned for that originator yet.
        assert_eq!(completed.status(&gtx("b", 1)), CompletedTransactionStatus::NotCompleted);
        assert!(completed.is_completed(&gtx("b", 5)));
    }

    #[test]
    fn test_leaver_watermarks_are_dropped() {
        let completed = CompletedTransactions::default();
        let start = Instant::now();
        completed.mark_completed(gtx("gone", 3), true, start);
        completed.mark_completed(gtx("a", 1), true, start + Duration::from_secs(30));
        let timeout = Duration::from_secs(10);
        let members = [Address::new("a")];

        completed.cleanup(start + Duration::from_secs(20), timeout, &members);
        assert_eq!(completed.status(&gtx("gone", 3)), CompletedTransactionStatus::Expired);

        // Second sweep: the leaver has nothing left in the map, its watermark goes.
        completed.mark_completed(gtx("a", 2), true, start + Duration::from_secs(30));
        completed.cleanup(start + Duration::from_secs(21), timeout, &members);
        assert_eq!(
            completed.status(&gtx("gone", 3)),
            CompletedTransactionStatus::NotCompleted
        );
    }
}
