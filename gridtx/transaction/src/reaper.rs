//! Background cleanup of the transaction table.
//!
//! Leaver cleanup runs on a small worker pool, since it may block on remote invocations. A
//! dedicated thread sweeps completed-transaction bookkeeping and orphaned remote transactions
//! every `reaper_wake_up_interval`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error};

use crate::error::TransactionResult;
use crate::table::TransactionTable;

#[derive(Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    cond: Condvar,
}

pub(crate) struct Reaper {
    workers: ThreadPool,
    shutdown: Arc<Shutdown>,
    sweeper: Option<JoinHandle<()>>,
}

impl Reaper {
    pub(crate) fn start(table: &Arc<TransactionTable>) -> TransactionResult<Self> {
        let name = format!("TxCleanupService,{}", table.address());
        let worker_name = name.clone();
        let workers = ThreadPoolBuilder::new()
            .num_threads(table.config().cleanup_threads.max(1))
            .thread_name(move |i| format!("{worker_name},{i}"))
            .build()?;

        let shutdown = Arc::new(Shutdown::default());
        // Completed-transaction bookkeeping does not exist under total order.
        let sweeper = if table.config().is_total_order() {
            None
        } else {
            let interval = table.config().reaper_wake_up_interval;
            let table = Arc::downgrade(table);
            let shutdown = Arc::clone(&shutdown);
            Some(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || run_sweeper(table, &shutdown, interval))?,
            )
        };

        Ok(Self {
            workers,
            shutdown,
            sweeper,
        })
    }

    /// Runs `task` on the cleanup workers.
    pub(crate) fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.workers.spawn(task);
    }

    pub(crate) fn shutdown(&mut self) {
        self.signal_shutdown();
        if let Some(sweeper) = self.sweeper.take() {
            if sweeper.join().is_err() {
                error!("transaction cleanup thread terminated abnormally");
            }
        }
        debug!("transaction cleanup service stopped");
    }

    fn signal_shutdown(&self) {
        *self.shutdown.stopped.lock() = true;
        self.shutdown.cond.notify_all();
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

fn run_sweeper(table: Weak<TransactionTable>, shutdown: &Shutdown, interval: Duration) {
    let mut stopped = shutdown.stopped.lock();
    while !*stopped {
        shutdown.cond.wait_for(&mut stopped, interval);
        if *stopped {
            break;
        }
        let keep_running = MutexGuard::unlocked(&mut stopped, || {
            let Some(table) = table.upgrade() else {
                return false;
            };
            if panic::catch_unwind(AssertUnwindSafe(|| table.sweep())).is_err() {
                error!(address = %table.address(), "failed to clean up the transaction table");
            }
            true
        });
        if !keep_running {
            break;
        }
    }
}
