//! Configuration of the transaction engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_REAPER_WAKE_UP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPLETED_TX_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CACHE_STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_LOCK_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockingMode {
    /// Locks are acquired at prepare time and conflicts are caught by the write-skew check.
    #[default]
    Optimistic,
    /// Locks are acquired eagerly, on every write.
    Pessimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionProtocol {
    /// Classic two-phase commit.
    #[default]
    Default,
    /// Prepares are delivered to every participant in the same global order.
    TotalOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub locking_mode: LockingMode,
    pub protocol: TransactionProtocol,
    /// Run the write-skew validator while preparing.
    pub write_skew_check: bool,
    /// Merge prepare and commit into a single round for every transaction.
    pub use_one_phase_commit: bool,
    /// Run the commit phase before returning to the caller.
    pub sync_commit_phase: bool,
    /// Run the rollback phase before returning to the caller.
    pub sync_rollback_phase: bool,
    /// The second phase is fire-and-forget: no acknowledgment, no lock release.
    pub second_phase_async: bool,
    /// Recovery is active and owns lock cleanup.
    pub recovery_enabled: bool,
    /// Period of the registry sweep.
    pub reaper_wake_up_interval: Duration,
    /// Age after which completed-transaction bookkeeping is pruned and idle remote
    /// transactions are rolled back.
    pub completed_tx_timeout: Duration,
    /// How long `stop` waits for in-flight transactions.
    pub cache_stop_timeout: Duration,
    /// Timeout attached to every remote invocation.
    pub rpc_timeout: Duration,
    /// How long a prepare waits for an earlier transaction writing the same keys.
    pub lock_acquisition_timeout: Duration,
    /// Threads of the worker running leaver cleanup.
    pub cleanup_threads: usize,
    /// Threads of the executor running asynchronous second phases.
    pub async_executor_threads: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            locking_mode: LockingMode::Optimistic,
            protocol: TransactionProtocol::Default,
            write_skew_check: true,
            use_one_phase_commit: false,
            sync_commit_phase: true,
            sync_rollback_phase: true,
            second_phase_async: false,
            recovery_enabled: false,
            reaper_wake_up_interval: DEFAULT_REAPER_WAKE_UP_INTERVAL,
            completed_tx_timeout: DEFAULT_COMPLETED_TX_TIMEOUT,
            cache_stop_timeout: DEFAULT_CACHE_STOP_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            lock_acquisition_timeout: DEFAULT_LOCK_ACQUISITION_TIMEOUT,
            cleanup_threads: 1,
            async_executor_threads: 2,
        }
    }
}

impl TransactionConfig {
    pub fn with_locking_mode(mut self, locking_mode: LockingMode) -> Self {
        self.locking_mode = locking_mode;
        self
    }

    pub fn with_protocol(mut self, protocol: TransactionProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_write_skew_check(mut self, enabled: bool) -> Self {
        self.write_skew_check = enabled;
        self
    }

    pub fn with_one_phase_commit(mut self, enabled: bool) -> Self {
        self.use_one_phase_commit = enabled;
        self
    }

    pub fn with_sync_commit_phase(mut self, enabled: bool) -> Self {
        self.sync_commit_phase = enabled;
        self
    }

    pub fn with_sync_rollback_phase(mut self, enabled: bool) -> Self {
        self.sync_rollback_phase = enabled;
        self
    }

    pub fn with_second_phase_async(mut self, enabled: bool) -> Self {
        self.second_phase_async = enabled;
        self
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }

    pub fn with_reaper_wake_up_interval(mut self, interval: Duration) -> Self {
        self.reaper_wake_up_interval = interval;
        self
    }

    pub fn with_completed_tx_timeout(mut self, timeout: Duration) -> Self {
        self.completed_tx_timeout = timeout;
        self
    }

    pub fn with_cache_stop_timeout(mut self, timeout: Duration) -> Self {
        self.cache_stop_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    #[inline]
    pub fn is_total_order(&self) -> bool {
        self.protocol == TransactionProtocol::TotalOrder
    }

    /// Whether prepares must run the write-skew validator.
    #[inline]
    pub fn needs_write_skew_check(&self) -> bool {
        self.write_skew_check && self.locking_mode == LockingMode::Optimistic
    }
}
