use super::{join_bounded, TraceCollector};
use crate::config::HealthSettings;
use crate::controller::{CancelToken, ReconnectController};
use crate::device::DeviceHandle;
use crate::events::ConnectionState;
use crate::session::LivenessProbe;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct PollerContext {
    device: DeviceHandle,
    probe: Arc<dyn LivenessProbe>,
    controller: Arc<ReconnectController>,
    collector: Arc<Mutex<TraceCollector>>,
    interval: Duration,
    suspect_interval: Duration,
    join_timeout: Duration,
}

impl PollerContext {
    fn lock_collector(&self) -> MutexGuard<'_, TraceCollector> {
        self.collector.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Monitor gave up on its own (budget spent or size cap), nothing to supervise
    fn is_halted(&self) -> bool {
        self.controller.state() == ConnectionState::Disconnected && !self.controller.is_lost()
    }
}

/// Periodic liveness probe for one device
///
/// Probes every `interval`, or every `suspect_interval` while the connection
/// is considered lost. A single failed probe stops the trace collector and
/// marks the connection lost; the next successful probe restarts it.
pub struct HealthPoller {
    context: Arc<PollerContext>,
    cancel: CancelToken,
    thread_handle: Option<JoinHandle<()>>,
}

impl HealthPoller {
    pub fn new(
        device: DeviceHandle,
        probe: Arc<dyn LivenessProbe>,
        controller: Arc<ReconnectController>,
        collector: Arc<Mutex<TraceCollector>>,
        settings: &HealthSettings,
        join_timeout: Duration,
    ) -> Self {
        Self {
            context: Arc::new(PollerContext {
                device,
                probe,
                controller,
                collector,
                interval: settings.interval(),
                suspect_interval: settings.suspect_interval(),
                join_timeout,
            }),
            cancel: CancelToken::new(),
            thread_handle: None,
        }
    }

    /// Start polling; does nothing if already running
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        self.cancel = CancelToken::new();
        let context = Arc::clone(&self.context);
        let cancel = self.cancel.clone();
        let handle = thread::spawn(move || {
            Self::poller_thread(context, cancel);
        });

        self.thread_handle = Some(handle);
        info!(
            "Health poller started for {} (every {:?})",
            self.context.device.mac, self.context.interval
        );
    }

    /// Stop polling, interrupting a pending sleep
    ///
    /// Waits at most `join_timeout` for the thread. Returns whether it was joined.
    pub fn stop(&mut self, join_timeout: Duration) -> bool {
        self.cancel.cancel();
        match self.thread_handle.take() {
            Some(handle) => join_bounded(handle, join_timeout, "Health poller"),
            None => true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    fn poller_thread(context: Arc<PollerContext>, cancel: CancelToken) {
        let mac = &context.device.mac;

        loop {
            if context.is_halted() {
                info!("Trace for {} halted, health poller exiting", mac);
                break;
            }

            let interval = if context.controller.is_lost() {
                context.suspect_interval
            } else {
                context.interval
            };
            if !cancel.sleep(interval) {
                break;
            }
            if context.is_halted() {
                continue;
            }

            let alive = context.probe.is_alive(&context.device);
            if cancel.is_cancelled() {
                break;
            }

            if !alive {
                Self::handle_loss(&context, &cancel);
            } else if context.controller.is_lost() {
                Self::handle_recovery(&context, &cancel);
            } else {
                debug!("Liveness probe ok for {}", mac);
            }
        }

        debug!("Health poller thread for {} finished", mac);
    }

    fn handle_loss(context: &PollerContext, cancel: &CancelToken) {
        let controller = &context.controller;

        if controller.is_lost() {
            debug!("{} still unreachable", context.device.mac);
        } else {
            warn!(
                "Liveness probe failed for {}, treating as connection loss",
                context.device.mac
            );
            let mut collector = context.lock_collector();
            if cancel.is_cancelled() {
                return;
            }
            collector.stop(context.join_timeout);
            controller.mark_lost();
        }

        if controller.state() == ConnectionState::Connected {
            controller.transition(ConnectionState::Disconnected);
        }
        controller.transition(ConnectionState::Connecting);
    }

    fn handle_recovery(context: &PollerContext, cancel: &CancelToken) {
        info!(
            "{} reachable again, restarting trace collection",
            context.device.mac
        );

        let mut collector = context.lock_collector();
        // Checked under the lock so a concurrent stop never sees a fresh collector
        if cancel.is_cancelled() {
            return;
        }
        collector.stop(context.join_timeout);
        if context.controller.state() == ConnectionState::Connected {
            context.controller.transition(ConnectionState::Disconnected);
        }
        context.controller.clear_lost();

        if let Err(e) = collector.start() {
            error!(
                "Failed to restart trace collection for {}: {}",
                context.device.mac, e
            );
            context.controller.mark_lost();
        }
    }
}

impl Drop for HealthPoller {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop(Duration::from_secs(1));
        }
    }
}
