//! Starts one [`crate::monitor::Monitor`] per enabled network and coordinates graceful shutdown
//! (spec §4.6, §5).

use crate::config::Config;
use crate::monitor::Monitor;
use crate::networks::NetworkId;
use crate::store::Store;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Force-exit guard: if shutdown hasn't completed within this long after a stop request, the
/// process exits rather than hang on a stuck cycle (spec §4.6, §5).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

pub struct Supervisor {
    workers: Vec<(NetworkId, JoinHandle<()>, mpsc::Sender<()>)>,
}

impl Supervisor {
    /// Opens a `Store` and starts one OS thread per enabled network, each running its monitor's
    /// cycle loop. Each network's cycle executes sequentially against its own store, cache, and
    /// rate-limiter state (spec §5); networks have no ordering between each other.
    pub fn start(config: &Config) -> Result<Self, crate::store::StoreError> {
        let mut workers = Vec::new();
        for &network in &config.enabled_networks {
            let store = Store::open(&config.db_folder, network)?;
            let monitor = Monitor::new(network, config, store);
            let (tx, rx) = mpsc::channel();
            let handle = std::thread::Builder::new()
                .name(format!("monitor-{}", network))
                .spawn(move || monitor.run_loop(rx))
                .expect("spawning a monitor thread should not fail");
            workers.push((network, handle, tx));
        }
        Ok(Supervisor { workers })
    }

    /// Signals every monitor to stop, waits for each in-flight cycle to finish, and returns.
    /// A background watchdog force-exits the process if shutdown doesn't complete within the
    /// grace period (spec §4.6).
    pub fn stop(self) {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        std::thread::spawn(move || {
            match done_rx.recv_timeout(SHUTDOWN_GRACE) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // Shutdown finished (or the sender was dropped after finishing); nothing to do.
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    log::error!(
                        "shutdown grace period ({:?}) elapsed with a cycle still in flight, forcing exit",
                        SHUTDOWN_GRACE
                    );
                    std::process::exit(1);
                }
            }
        });

        for (network, handle, tx) in self.workers {
            // Sending wakes the interruptible sleep immediately; the in-flight cycle (if any)
            // still runs to completion before `run_loop` returns.
            let _ = tx.send(());
            if handle.join().is_err() {
                log::error!("[{}] monitor thread panicked during shutdown", network);
            }
        }

        // Dropping the sender disconnects `done_rx`, telling the watchdog shutdown completed
        // cleanly within the grace period.
        drop(done_tx);
    }
}
