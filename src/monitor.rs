//! Per-device trace monitor
//!
//! [`TraceMonitor`] is the surface test code drives: it starts and stops the
//! collector and health poller pair, controls buffering and runs searches over
//! the buffered trace. Client devices linked to a gateway cascade lifecycle and
//! buffering calls to the gateway's monitor, one level deep.

use crate::buffer::TraceBuffer;
use crate::collectors::trace_collector::line_prefix;
use crate::collectors::{CollectorSettings, HealthPoller, TraceCollector};
use crate::config::Config;
use crate::controller::{Failure, ReconnectController};
use crate::device::{normalize_mac, DeviceHandle};
use crate::error::{ConnectionError, SearchError, TraceError};
use crate::events::{ConnectionState, SearchOutcome, TraceSource};
use crate::registry::TracingSwitch;
use crate::search::{PatternSearchEngine, SearchRequest};
use crate::session::{ConnectionProvider, CrashHook, LivenessProbe, PromptResponder};
use crate::suppressor::DuplicateSuppressor;
use crate::tracelog::TraceLog;
use log::{debug, error, info, warn, Level};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker pair of a started monitor
struct Running {
    collector: Arc<Mutex<TraceCollector>>,
    poller: HealthPoller,
}

/// Trace monitor for one device
pub struct TraceMonitor {
    device: DeviceHandle,
    config: Config,
    prompts: PromptResponder,
    provider: Arc<dyn ConnectionProvider>,
    probe: Arc<dyn LivenessProbe>,
    crash_hook: Option<Arc<dyn CrashHook>>,
    switch: TracingSwitch,
    controller: Arc<ReconnectController>,
    buffer: Arc<TraceBuffer>,
    suppressor: Arc<Mutex<DuplicateSuppressor>>,
    search: PatternSearchEngine,
    trace_log: Mutex<Option<Arc<TraceLog>>>,
    running: Mutex<Option<Running>>,
    gateway: Mutex<Option<Weak<TraceMonitor>>>,
    /// Set once a client monitor links to this one
    serves_clients: AtomicBool,
}

impl TraceMonitor {
    /// Create an idle monitor for `device`
    ///
    /// # Errors
    ///
    /// Returns `TraceError::SerialTraceRack` for devices traced over serial and
    /// `TraceError::Config` for unusable prompt rules.
    pub fn new(
        device: DeviceHandle,
        config: &Config,
        provider: Arc<dyn ConnectionProvider>,
        probe: Arc<dyn LivenessProbe>,
        crash_hook: Option<Arc<dyn CrashHook>>,
        switch: TracingSwitch,
    ) -> Result<Self, TraceError> {
        if config.uses_serial_trace(&device) {
            return Err(TraceError::SerialTraceRack(device.mac.clone()));
        }
        let prompts = PromptResponder::new(&config.connection.prompts)?;

        Ok(Self {
            controller: Arc::new(ReconnectController::new(config.reconnect.max_attempts)),
            buffer: Arc::new(TraceBuffer::new(config.trace.buffer_on_start)),
            suppressor: Arc::new(Mutex::new(DuplicateSuppressor::new(
                config.trace.duplicate_line_limit,
            ))),
            search: PatternSearchEngine::new(config.search.poll_interval()),
            device,
            config: config.clone(),
            prompts,
            provider,
            probe,
            crash_hook,
            switch,
            trace_log: Mutex::new(None),
            running: Mutex::new(None),
            gateway: Mutex::new(None),
            serves_clients: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Link this client monitor to its gateway's monitor
    ///
    /// Ignored unless this device is a client of exactly that gateway.
    pub fn link_gateway(&self, gateway: &Arc<TraceMonitor>) -> bool {
        let matches = self.device.cascades_to_gateway()
            && self.device.gateway_mac.as_deref().map(normalize_mac)
                == Some(gateway.device.normalized_id());
        if !matches {
            debug!(
                "{} is not a client of {}, not linking",
                self.device.mac, gateway.device.mac
            );
            return false;
        }

        *lock(&self.gateway) = Some(Arc::downgrade(gateway));
        gateway.serves_clients.store(true, Ordering::SeqCst);
        info!(
            "Linked client {} to gateway {}",
            self.device.mac, gateway.device.mac
        );
        true
    }

    /// Gateway monitor this client cascades to, if still registered
    pub fn linked_gateway(&self) -> Option<Arc<TraceMonitor>> {
        lock(&self.gateway).as_ref().and_then(Weak::upgrade)
    }

    fn cascade(&self, operation: &str, apply: impl FnOnce(&TraceMonitor)) {
        if !self.device.cascades_to_gateway() {
            return;
        }
        match self.linked_gateway() {
            Some(gateway) => {
                info!(
                    "Cascading {} from {} to gateway {}",
                    operation, self.device.mac, gateway.device.mac
                );
                apply(&gateway);
            }
            None => debug!(
                "No gateway monitor registered for {}, {} not cascaded",
                self.device.mac, operation
            ),
        }
    }

    /// Trace file for this device, opened on first use
    fn trace_log(&self) -> Result<Arc<TraceLog>, TraceError> {
        let mut slot = lock(&self.trace_log);
        if let Some(log) = slot.as_ref() {
            return Ok(Arc::clone(log));
        }
        let log = Arc::new(TraceLog::open(
            &self.config.trace.directory,
            &self.device,
            self.config.trace.size_limit_kb,
        )?);
        *slot = Some(Arc::clone(&log));
        Ok(log)
    }

    /// Start collecting trace, cascading to a linked gateway
    ///
    /// Does nothing if tracing is disabled process-wide or the monitor is
    /// already running.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionError::NoTarget` if the device has no address and
    /// with a trace log error if the trace file cannot be used.
    pub fn start_trace(&self) -> Result<(), TraceError> {
        if !self.switch.is_enabled() {
            info!("Tracing disabled, not starting trace for {}", self.device.mac);
            return Ok(());
        }

        self.start_local()?;
        self.cascade("start trace", |gateway| {
            if let Err(e) = gateway.start_local() {
                warn!("Failed to start gateway trace for {}: {}", gateway.device.mac, e);
            }
        });
        Ok(())
    }

    fn start_local(&self) -> Result<(), TraceError> {
        let mut running = lock(&self.running);
        let halted = self.controller.state() == ConnectionState::Disconnected
            && !self.controller.is_lost();
        if running.is_some() && !halted {
            debug!("Trace already running for {}", self.device.mac);
            return Ok(());
        }
        // A halted run leaves finished threads behind
        if let Some(previous) = running.take() {
            self.stop_workers(previous);
        }

        if self.device.connection_target().is_none() {
            return Err(ConnectionError::NoTarget(self.device.mac.clone()).into());
        }
        let trace_log = self.trace_log()?;
        if let Err(e) = trace_log.check_limit() {
            error!("Not starting trace for {}: {}", self.device.mac, e);
            return Err(e.into());
        }

        self.controller.reset();
        if self.config.trace.buffer_on_start {
            self.buffer.start_buffering();
        }

        let primary_source = if self.serves_clients.load(Ordering::SeqCst) {
            TraceSource::Gateway
        } else {
            TraceSource::Primary
        };
        let settings = CollectorSettings {
            device: self.device.clone(),
            trace_command: self
                .config
                .connection
                .trace_command_for(&self.device.model)
                .to_string(),
            primary_source,
            additional: self.config.additional_logger_for(&self.device),
            prompts: self.prompts.clone(),
            duplicate_line_limit: self.config.trace.duplicate_line_limit,
            retry_delay: self.config.reconnect.retry_delay(),
            settle_delay: self.config.reconnect.settle_delay(),
        };
        let crash_hook = if self.config.trace.crash_analysis {
            self.crash_hook.clone()
        } else {
            None
        };

        let collector = Arc::new(Mutex::new(TraceCollector::new(
            settings,
            Arc::clone(&self.provider),
            Arc::clone(&self.controller),
            Arc::clone(&self.buffer),
            trace_log,
            crash_hook,
            Arc::clone(&self.suppressor),
        )));
        lock(&collector).start()?;

        let mut poller = HealthPoller::new(
            self.device.clone(),
            Arc::clone(&self.probe),
            Arc::clone(&self.controller),
            Arc::clone(&collector),
            &self.config.health,
            self.config.reconnect.stop_join_timeout(),
        );
        poller.start();

        *running = Some(Running { collector, poller });
        info!("Trace started for {}", self.device.mac);
        Ok(())
    }

    /// Stop collecting trace, cascading to a linked gateway
    ///
    /// Safe to call repeatedly. Does nothing if tracing is disabled process-wide.
    pub fn stop_trace(&self) {
        if !self.switch.is_enabled() {
            info!("Tracing disabled, not stopping trace for {}", self.device.mac);
            return;
        }

        self.stop_local();
        self.cascade("stop trace", |gateway| gateway.stop_local());
    }

    /// Stop this monitor only, ignoring the tracing switch
    pub fn shutdown(&self) {
        self.stop_local();
    }

    fn stop_local(&self) {
        let previous = lock(&self.running).take();
        if let Some(previous) = previous {
            self.stop_workers(previous);
            info!("Trace stopped for {}", self.device.mac);
        }

        self.controller.halt();
        self.buffer.clear();
        if let Some(log) = lock(&self.trace_log).as_ref() {
            if let Err(e) = log.flush() {
                warn!("Failed to flush trace file for {}: {}", self.device.mac, e);
            }
        }
    }

    /// Poller first, so it cannot restart the collector behind us
    fn stop_workers(&self, running: Running) {
        let timeout = self.config.reconnect.stop_join_timeout();
        let Running {
            collector,
            mut poller,
        } = running;
        poller.stop(timeout);
        lock(&collector).stop(timeout);
    }

    /// Clear the buffer and start retaining lines for search
    pub fn start_buffering(&self) {
        self.buffer.start_buffering();
        debug!("Buffering started for {}", self.device.mac);
        self.cascade("start buffering", |gateway| gateway.buffer.start_buffering());
    }

    /// Stop retaining lines and clear the buffer
    pub fn stop_buffering(&self) {
        self.buffer.stop_buffering();
        debug!("Buffering stopped for {}", self.device.mac);
        self.cascade("stop buffering", |gateway| gateway.buffer.stop_buffering());
    }

    /// Drop all buffered lines and reset the search mark
    pub fn clear_buffer(&self) {
        self.buffer.clear();
        debug!("Buffer cleared for {}", self.device.mac);
    }

    pub fn is_buffering(&self) -> bool {
        self.buffer.is_buffering()
    }

    /// Wait for a line matching `pattern` that arrives after this call
    ///
    /// Buffering is forced on and the mark moved to the tail for the duration
    /// of the wait; both are restored afterwards.
    ///
    /// # Errors
    ///
    /// Invalid input and a monitor that is not collecting are errors; a
    /// timeout is `Ok(false)`.
    pub fn wait_for_trace_string(&self, pattern: &str, timeout: Duration) -> Result<bool, TraceError> {
        let was_buffering = self.buffer.set_buffering(true);
        let previous_mark = self.buffer.mark_to_tail();

        let result = self.search_and_wait_for_trace(pattern, timeout, false, true, false);

        self.buffer.set_mark(previous_mark);
        self.buffer.set_buffering(was_buffering);
        result.map(|line| line.is_some())
    }

    /// Search buffered trace for `pattern`, waiting up to `timeout` for a match
    ///
    /// Returns the matched line, or `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::NotRunning` if nothing is being collected, and
    /// rejects invalid patterns and zero timeouts before waiting.
    pub fn search_and_wait_for_trace(
        &self,
        pattern: &str,
        timeout: Duration,
        from_start: bool,
        first_occurrence_only: bool,
        print_logs: bool,
    ) -> Result<Option<String>, TraceError> {
        let request = SearchRequest {
            from_start,
            first_occurrence_only,
            print_logs,
            ..SearchRequest::new(pattern, timeout)
        };
        match self.search(&request)? {
            SearchOutcome::Found(line) => Ok(Some(line.text)),
            SearchOutcome::TimedOut => Ok(None),
            SearchOutcome::NotRunning(reason) => Err(SearchError::NotRunning(reason).into()),
        }
    }

    /// Run a search and return its tagged outcome
    pub fn search(&self, request: &SearchRequest<'_>) -> Result<SearchOutcome, TraceError> {
        let outcome = self.search.search(
            &self.buffer,
            self.controller.is_monitoring_started(),
            request,
        )?;
        Ok(outcome)
    }

    /// Write a marker line to the trace file only
    ///
    /// # Errors
    ///
    /// Fails if the trace file cannot be opened or has reached its cap.
    pub fn insert_into_trace(&self, text: &str, level: Level) -> Result<(), TraceError> {
        if !self.switch.is_enabled() {
            debug!("Tracing disabled, not inserting into trace for {}", self.device.mac);
            return Ok(());
        }
        let entry = format!("{}{}", line_prefix(&self.device, &TraceSource::Primary), text);
        self.trace_log()?.append(level, &entry)?;
        Ok(())
    }

    /// Newest buffered line, followed by the one before it once more than two
    /// lines are buffered
    pub fn get_last_trace_line(&self) -> Option<String> {
        let total = self.buffer.len();
        let mut newest_first = self.buffer.last_lines(2).into_iter();
        let last = newest_first.next()?;
        match newest_first.next() {
            Some(previous) if total > 2 => Some(last + &previous),
            _ => Some(last),
        }
    }

    pub fn get_trace_status(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Whether a trace session was ever opened since the last start
    pub fn is_monitoring_started(&self) -> bool {
        self.controller.is_monitoring_started()
    }

    /// Repeated lines dropped over the life of this monitor
    pub fn suppressed_line_count(&self) -> u64 {
        lock(&self.suppressor).suppressed_total()
    }

    /// Why the monitor last failed to connect
    pub fn last_failure(&self) -> Option<Failure> {
        self.controller.last_failure()
    }
}

impl Drop for TraceMonitor {
    fn drop(&mut self) {
        self.stop_local();
    }
}
