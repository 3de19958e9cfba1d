use std::thread;
use std::time::{Duration, Instant};

use gridtx_test::Cluster;
use gridtx_transaction::TransactionConfig;

#[allow(dead_code)]
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Defaults with timeouts short enough for tests.
pub fn test_config() -> TransactionConfig {
    TransactionConfig::default()
        .with_cache_stop_timeout(Duration::from_millis(200))
        .with_lock_acquisition_timeout(Duration::from_secs(2))
        .with_rpc_timeout(Duration::from_secs(2))
}

/// Members `a`, `b` and `c`; `k` is owned by `b` and `c`.
pub fn three_nodes(config: TransactionConfig) -> Cluster {
    init_tracing();
    Cluster::builder()
        .members(["a", "b", "c"])
        .config(config)
        .owners("k", ["b", "c"])
        .start()
        .unwrap()
}

#[allow(dead_code)]
/// Polls `condition` until it holds, panicking after [`WAIT_TIMEOUT`].
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
