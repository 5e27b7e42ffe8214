/// Trace read loop for one device
pub mod trace_collector;

/// Periodic liveness probe and restart of the trace collector
pub mod health_poller;

pub use health_poller::HealthPoller;
pub use trace_collector::{CollectorSettings, TraceCollector};

use log::{debug, warn};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Join `handle`, waiting at most `timeout`
///
/// A thread still running after `timeout` is left detached. Returns whether
/// the thread was joined.
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    let poll = Duration::from_millis(10);

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{} thread did not stop within {:?}, detaching", name, timeout);
            return false;
        }
        thread::sleep(poll);
    }

    if handle.join().is_err() {
        warn!("{} thread panicked", name);
    } else {
        debug!("{} thread joined", name);
    }
    true
}
