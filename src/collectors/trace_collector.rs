use super::join_bounded;
use crate::buffer::TraceBuffer;
use crate::config::AdditionalLoggerSpec;
use crate::controller::{CancelToken, ReconnectController};
use crate::device::DeviceHandle;
use crate::error::{ConnectionError, TraceLogError};
use crate::events::{ConnectionState, TraceLine, TraceSource};
use crate::session::{CommandType, ConnectionProvider, CrashHook, PromptResponder, Session};
use crate::suppressor::{strip_timestamp, Admission, DuplicateSuppressor};
use crate::tracelog::TraceLog;
use log::{debug, error, info, warn, Level};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the read loop checks for cancellation while no line arrives
const RECV_POLL: Duration = Duration::from_millis(100);

type SessionSlot = Arc<Mutex<Vec<Box<dyn Session>>>>;
type StreamPair = (Box<dyn Read + Send>, Option<Box<dyn Write + Send>>);

/// Prefix written before each line in the trace file
///
/// Primary lines carry the test id, secondary console lines the stream name.
pub fn line_prefix(device: &DeviceHandle, source: &TraceSource) -> String {
    match source {
        TraceSource::AdditionalLogger(name) => format!("[{}][[{}]]", device.mac, name),
        TraceSource::Primary | TraceSource::Gateway => {
            format!("[{}][{}]", device.mac, device.test_id())
        }
    }
}

/// Fixed parameters of the read loop
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub device: DeviceHandle,
    /// Command starting the primary trace stream
    pub trace_command: String,
    /// Tag of lines from the primary stream
    pub primary_source: TraceSource,
    pub additional: Option<AdditionalLoggerSpec>,
    pub prompts: PromptResponder,
    pub duplicate_line_limit: usize,
    /// Wait between failed connect attempts
    pub retry_delay: Duration,
    /// Wait before reading again after a reconnect
    pub settle_delay: Duration,
}

/// Collaborators of the read loop
struct Shared {
    settings: CollectorSettings,
    provider: Arc<dyn ConnectionProvider>,
    controller: Arc<ReconnectController>,
    buffer: Arc<TraceBuffer>,
    trace_log: Arc<TraceLog>,
    crash_hook: Option<Arc<dyn CrashHook>>,
    /// Owned by the monitor, so runs of repeats span restarts
    suppressor: Arc<Mutex<DuplicateSuppressor>>,
}

impl Shared {
    fn lock_suppressor(&self) -> MutexGuard<'_, DuplicateSuppressor> {
        self.suppressor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum StreamEvent {
    Line(TraceSource, String),
    Closed(TraceSource, String),
}

/// Why a session's read loop ended
enum ReadEnd {
    Cancelled,
    SizeLimit,
    Lost { lines_read: u64, reason: String },
}

/// Trace read loop for one device
///
/// Owns a background thread that opens the session, issues the trace command
/// and routes every line read through duplicate suppression into the search
/// buffer and the trace file. Connect failures before the first line are
/// retried against the reconnect budget; a stream lost after lines were read
/// is left to the health poller.
pub struct TraceCollector {
    shared: Arc<Shared>,
    cancel: CancelToken,
    sessions: SessionSlot,
    thread_handle: Option<JoinHandle<()>>,
}

impl TraceCollector {
    pub fn new(
        settings: CollectorSettings,
        provider: Arc<dyn ConnectionProvider>,
        controller: Arc<ReconnectController>,
        buffer: Arc<TraceBuffer>,
        trace_log: Arc<TraceLog>,
        crash_hook: Option<Arc<dyn CrashHook>>,
        suppressor: Arc<Mutex<DuplicateSuppressor>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                provider,
                controller,
                buffer,
                trace_log,
                crash_hook,
                suppressor,
            }),
            cancel: CancelToken::new(),
            sessions: SessionSlot::default(),
            thread_handle: None,
        }
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.shared.settings.device
    }

    /// Start the read loop
    ///
    /// Does nothing if the loop is already running.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::NoTarget` if the device has no address.
    pub fn start(&mut self) -> Result<(), ConnectionError> {
        if self.is_running() {
            return Ok(());
        }

        let device = &self.shared.settings.device;
        if device.connection_target().is_none() {
            return Err(ConnectionError::NoTarget(device.mac.clone()));
        }

        self.shared.controller.transition(ConnectionState::Connecting);

        // Fresh token and slot per start, so a detached old thread stays cancelled
        self.cancel = CancelToken::new();
        self.sessions = SessionSlot::default();

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let sessions = Arc::clone(&self.sessions);
        let handle = thread::spawn(move || {
            Self::collector_thread(shared, cancel, sessions);
        });

        self.thread_handle = Some(handle);
        info!("Trace collector started for {}", device.mac);
        Ok(())
    }

    /// Stop the read loop, closing its sessions
    ///
    /// Waits at most `join_timeout` for the thread. Returns whether it was joined.
    pub fn stop(&mut self, join_timeout: Duration) -> bool {
        self.cancel.cancel();
        Self::close_sessions(&self.sessions);

        let joined = match self.thread_handle.take() {
            Some(handle) => join_bounded(handle, join_timeout, "Trace collector"),
            None => true,
        };
        debug!("Trace collector stopped for {}", self.device().mac);
        joined
    }

    /// Whether the background thread is alive
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    fn close_sessions(sessions: &SessionSlot) {
        let drained: Vec<Box<dyn Session>> = sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut session in drained {
            if let Err(e) = session.disconnect() {
                warn!("Failed to close trace session: {}", e);
            }
        }
    }

    fn register_session(sessions: &SessionSlot, session: Box<dyn Session>) {
        sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
    }

    /// Main collector thread function
    ///
    /// Runs sessions back to back until cancelled, halted or the stream is lost
    /// after a successful read. Once cancelled the thread never touches the
    /// controller again: a detached thread may outlive its `stop`, and the
    /// controller then belongs to the next run.
    fn collector_thread(shared: Arc<Shared>, cancel: CancelToken, sessions: SessionSlot) {
        let settings = &shared.settings;
        let controller = &shared.controller;
        let mac = &settings.device.mac;
        let mut attempt: u32 = 0;

        while !cancel.is_cancelled() {
            attempt += 1;

            if attempt > 1 && !settings.settle_delay.is_zero() {
                info!(
                    "Waiting {:?} for {} to settle before reconnecting",
                    settings.settle_delay, mac
                );
                if !cancel.sleep(settings.settle_delay) {
                    break;
                }
            }

            debug!("Connect attempt {} for {}", attempt, mac);
            let end = Self::run_session(&shared, &cancel, &sessions).unwrap_or_else(|e| {
                ReadEnd::Lost {
                    lines_read: 0,
                    reason: e.to_string(),
                }
            });
            Self::close_sessions(&sessions);

            if cancel.is_cancelled() {
                debug!("Trace collection for {} cancelled", mac);
                break;
            }
            match end {
                ReadEnd::Cancelled => {
                    debug!("Trace collection for {} cancelled", mac);
                    break;
                }
                ReadEnd::SizeLimit => {
                    controller.halt();
                    break;
                }
                ReadEnd::Lost { lines_read, reason } if lines_read > 0 => {
                    warn!(
                        "Trace stream for {} lost after {} lines: {}",
                        mac, lines_read, reason
                    );
                    // Lost before Disconnected, so the poller never sees a halted monitor
                    controller.mark_lost();
                    controller.transition(ConnectionState::Disconnected);
                    break;
                }
                ReadEnd::Lost { reason, .. } => {
                    if !controller.record_failure(reason) {
                        error!(
                            "Trace for {} stopped: no connection after {} attempts",
                            mac,
                            controller.max_attempts()
                        );
                        controller.halt();
                        break;
                    }
                    if controller.state() == ConnectionState::Connected {
                        controller.transition(ConnectionState::Disconnected);
                    }
                    controller.transition(ConnectionState::Connecting);

                    if !cancel.sleep(settings.retry_delay) {
                        break;
                    }
                }
            }
        }

        info!(
            "Trace collector thread for {} finished, {} repeated lines suppressed so far",
            mac,
            shared.lock_suppressor().suppressed_total()
        );
    }

    /// Issue `command` on `session` and take its streams
    fn init_stream(
        shared: &Shared,
        session: &mut dyn Session,
        command_type: CommandType,
        command: &str,
    ) -> Result<StreamPair, ConnectionError> {
        shared
            .provider
            .execute(&shared.settings.device, session, command_type, command)?;
        let reader = session.take_reader().ok_or_else(|| {
            ConnectionError::StreamUnavailable(format!("{:?} session has no output", command_type))
        })?;
        Ok((reader, session.take_writer()))
    }

    /// Open the sessions and read until the stream ends or the loop is cancelled
    fn run_session(
        shared: &Shared,
        cancel: &CancelToken,
        sessions: &SessionSlot,
    ) -> Result<ReadEnd, ConnectionError> {
        let settings = &shared.settings;
        let device = &settings.device;

        if let Err(e) = shared.provider.cleanup_device_trace(device) {
            warn!("Failed to clean up old trace on {}: {}", device.mac, e);
        }

        let (tx, rx) = mpsc::channel();

        let mut primary = shared.provider.get_connection(device)?;
        let streams = Self::init_stream(
            shared,
            primary.as_mut(),
            CommandType::TraceInit,
            &settings.trace_command,
        );
        Self::register_session(sessions, primary);
        let (reader, writer) = streams?;
        Self::spawn_reader(reader, settings.primary_source.clone(), tx.clone());

        if let Some(spec) = &settings.additional {
            match Self::open_additional(shared, sessions, spec) {
                Ok(reader) => Self::spawn_reader(
                    reader,
                    TraceSource::AdditionalLogger(spec.name.clone()),
                    tx.clone(),
                ),
                Err(e) => warn!(
                    "Additional trace '{}' unavailable for {}: {}",
                    spec.name, device.mac, e
                ),
            }
        }
        drop(tx);

        // stop() cancels before closing sessions, so a late registration is seen here
        if cancel.is_cancelled() {
            return Ok(ReadEnd::Cancelled);
        }

        shared.controller.transition(ConnectionState::Connected);
        shared.controller.mark_monitoring_started();
        info!(
            "Trace connected for {}: {}",
            device.mac, settings.trace_command
        );

        Ok(Self::read_loop(shared, cancel, rx, writer))
    }

    fn open_additional(
        shared: &Shared,
        sessions: &SessionSlot,
        spec: &AdditionalLoggerSpec,
    ) -> Result<Box<dyn Read + Send>, ConnectionError> {
        let mut session = shared.provider.get_connection(&shared.settings.device)?;
        let streams = Self::init_stream(
            shared,
            session.as_mut(),
            CommandType::AdditionalTraceInit,
            &spec.command,
        );
        Self::register_session(sessions, session);
        let (reader, _) = streams?;
        info!(
            "Additional trace '{}' started for {} over {}",
            spec.name, shared.settings.device.mac, spec.utility
        );
        Ok(reader)
    }

    /// Forward lines from `reader` to the read loop until it ends
    fn spawn_reader(reader: Box<dyn Read + Send>, source: TraceSource, tx: Sender<StreamEvent>) {
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => {
                        let _ = tx.send(StreamEvent::Closed(source, "end of stream".to_string()));
                        break;
                    }
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&raw)
                            .trim_end_matches(|c| c == '\r' || c == '\n')
                            .to_string();
                        if tx.send(StreamEvent::Line(source.clone(), text)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Closed(source, e.to_string()));
                        break;
                    }
                }
            }
        });
    }

    fn read_loop(
        shared: &Shared,
        cancel: &CancelToken,
        rx: Receiver<StreamEvent>,
        mut writer: Option<Box<dyn Write + Send>>,
    ) -> ReadEnd {
        let settings = &shared.settings;
        let mac = &settings.device.mac;
        let mut lines_read: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return ReadEnd::Cancelled;
            }

            let event = match rx.recv_timeout(RECV_POLL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return ReadEnd::Lost {
                        lines_read,
                        reason: "all trace streams closed".to_string(),
                    }
                }
            };

            match event {
                StreamEvent::Line(source, text) => {
                    if lines_read == 0 {
                        shared.controller.reset_budget();
                    }
                    lines_read += 1;

                    if let Some(response) = settings.prompts.respond(&text) {
                        Self::answer_prompt(writer.as_mut(), mac, response);
                    }

                    match Self::route_line(shared, source, text) {
                        Ok(()) => {}
                        Err(e @ TraceLogError::SizeLimitExceeded { .. }) => {
                            Self::log_size_limit(&settings.device, &e);
                            return ReadEnd::SizeLimit;
                        }
                        Err(e) => warn!("Failed to persist trace for {}: {}", mac, e),
                    }
                }
                StreamEvent::Closed(source, reason) if source == settings.primary_source => {
                    return ReadEnd::Lost { lines_read, reason };
                }
                StreamEvent::Closed(source, reason) => {
                    warn!("{:?} stream for {} closed: {}", source, mac, reason);
                }
            }
        }
    }

    fn answer_prompt(writer: Option<&mut Box<dyn Write + Send>>, mac: &str, response: &str) {
        let Some(writer) = writer else {
            warn!("Prompt on {} but the session takes no input", mac);
            return;
        };
        let mut write = || -> std::io::Result<()> {
            writer.write_all(response.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()
        };
        match write() {
            Ok(()) => debug!("Answered prompt on {}", mac),
            Err(e) => warn!("Failed to answer prompt on {}: {}", mac, e),
        }
    }

    /// Suppress, persist, analyse and buffer one line, in that order
    fn route_line(
        shared: &Shared,
        source: TraceSource,
        text: String,
    ) -> Result<(), TraceLogError> {
        let device = &shared.settings.device;
        let admission = shared.lock_suppressor().admit(&text);
        if admission == Admission::FloodDetected {
            warn!(
                "Line repeated {} times on {}, dropping repeats: {}",
                shared.settings.duplicate_line_limit,
                device.mac,
                strip_timestamp(&text)
            );
        }
        if !admission.is_admitted() {
            return Ok(());
        }

        let line = TraceLine::new(text, source);
        let entry = format!("{}{}", line_prefix(device, &line.source), line.text);
        let persisted = shared.trace_log.append(Level::Trace, &entry);

        if let Some(hook) = &shared.crash_hook {
            if let Err(e) = hook.on_line(device, &line) {
                warn!("Crash analysis failed on {}: {:#}", device.mac, e);
            }
        }

        shared.buffer.push(line);
        persisted
    }

    fn log_size_limit(device: &DeviceHandle, err: &TraceLogError) {
        error!("****************************************************************");
        error!("TRACE STOPPED FOR {}", device.mac);
        error!("{}", err);
        error!("No further trace will be collected for this device");
        error!("****************************************************************");
    }
}

impl Drop for TraceCollector {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop(Duration::from_secs(1));
        }
    }
}
