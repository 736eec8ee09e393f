//! Background save and compaction.

use kestrel_common::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stop flag a sleeping task can be woken from.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    /// Sleeps up to `timeout`. Returns true once stop was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cond.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// Thread that runs a maintenance pass every interval until stopped.
///
/// A pass saves unsaved changes and compacts sparse chunks. A failing pass
/// is logged and retried at the next interval; a store that panicked stops
/// accepting writes on its own.
pub struct MaintenanceTask {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceTask {
    /// Starts the thread. `pass` runs first after one full interval.
    pub fn start(interval: Duration, pass: impl Fn() -> Result<()> + Send + 'static) -> Result<Self> {
        let signal = Arc::new(StopSignal::default());
        let worker = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("kestrel-maintenance".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "Maintenance task started");
                while !worker.wait(interval) {
                    match pass() {
                        Ok(()) => debug!("Maintenance pass finished"),
                        Err(e) => warn!(error = %e, "Maintenance pass failed"),
                    }
                }
                info!("Maintenance task stopped");
            })?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for a running pass to finish.
    pub fn stop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.stop();
    }
}
