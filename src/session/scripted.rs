use super::{CommandType, ConnectionProvider, LivenessProbe, Session};
use crate::device::DeviceHandle;
use crate::error::ConnectionError;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of one scripted connect call
#[derive(Debug, Clone)]
pub enum ScriptedConnect {
    /// `get_connection` fails with the given reason
    Refuse(String),
    /// Session whose output yields `lines`, then ends unless `hold_open`
    Stream { lines: Vec<String>, hold_open: bool },
}

impl ScriptedConnect {
    pub fn stream<S: Into<String>>(lines: impl IntoIterator<Item = S>, hold_open: bool) -> Self {
        ScriptedConnect::Stream {
            lines: lines.into_iter().map(Into::into).collect(),
            hold_open,
        }
    }
}

/// Output stream fed through a channel, ended by a shared close flag
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            match self.rx.recv_timeout(Duration::from_millis(10)) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Input stream recording complete lines
struct RecordingWriter {
    partial: Vec<u8>,
    written: Arc<Mutex<Vec<String>>>,
}

impl Write for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.partial.extend_from_slice(buf);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            lock(&self.written).push(text);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ScriptedSession {
    reader: Option<ChannelReader>,
    closed: Arc<AtomicBool>,
    written: Arc<Mutex<Vec<String>>>,
}

impl Session for ScriptedSession {
    fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::StreamUnavailable(
                "session closed".to_string(),
            ));
        }
        lock(&self.written).push(line.to_string());
        Ok(())
    }

    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader
            .take()
            .map(|reader| Box::new(reader) as Box<dyn Read + Send>)
    }

    fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        Some(Box::new(RecordingWriter {
            partial: Vec::new(),
            written: Arc::clone(&self.written),
        }))
    }

    fn disconnect(&mut self) -> Result<(), ConnectionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct OpenStream {
    feed: Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// In-memory connection provider replaying a script, for testing and development
///
/// Each `get_connection` call consumes the next scripted outcome; an exhausted
/// script refuses further connections. Streams opened with `hold_open` stay
/// readable until disconnected, and more lines can be fed to them.
#[derive(Default)]
pub struct ScriptedConnectionProvider {
    script: Mutex<VecDeque<ScriptedConnect>>,
    streams: Mutex<Vec<OpenStream>>,
    commands: Mutex<Vec<(CommandType, String)>>,
    written: Arc<Mutex<Vec<String>>>,
    connects: AtomicUsize,
}

impl ScriptedConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider replaying `script` in order
    pub fn with_script(script: impl IntoIterator<Item = ScriptedConnect>) -> Self {
        let provider = Self::new();
        for step in script {
            provider.push(step);
        }
        provider
    }

    /// Append one outcome to the script
    pub fn push(&self, step: ScriptedConnect) {
        lock(&self.script).push_back(step);
    }

    /// Number of `get_connection` calls so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Commands issued so far, in order
    pub fn commands(&self) -> Vec<(CommandType, String)> {
        lock(&self.commands).clone()
    }

    /// Lines written to any session's input
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.written).clone()
    }

    /// Feed a line to the `index`th opened stream
    ///
    /// Returns `false` if no such stream is open.
    pub fn feed_stream(&self, index: usize, line: &str) -> bool {
        let streams = lock(&self.streams);
        match streams.get(index) {
            Some(stream) if !stream.closed.load(Ordering::SeqCst) => stream
                .feed
                .send(format!("{}\n", line).into_bytes())
                .is_ok(),
            _ => false,
        }
    }

    /// Feed a line to the most recently opened stream
    pub fn feed(&self, line: &str) -> bool {
        let last = lock(&self.streams).len().checked_sub(1);
        last.map_or(false, |index| self.feed_stream(index, line))
    }

    /// End the `index`th opened stream as if the device dropped it
    pub fn drop_stream(&self, index: usize) {
        if let Some(stream) = lock(&self.streams).get(index) {
            stream.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Whether the `index`th opened stream has been closed
    pub fn is_stream_closed(&self, index: usize) -> bool {
        lock(&self.streams)
            .get(index)
            .map_or(true, |stream| stream.closed.load(Ordering::SeqCst))
    }
}

impl ConnectionProvider for ScriptedConnectionProvider {
    fn get_connection(&self, device: &DeviceHandle) -> Result<Box<dyn Session>, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if device.connection_target().is_none() {
            return Err(ConnectionError::NoTarget(device.mac.clone()));
        }

        let step = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| ScriptedConnect::Refuse("script exhausted".to_string()));

        match step {
            ScriptedConnect::Refuse(reason) => Err(ConnectionError::ConnectFailed(reason)),
            ScriptedConnect::Stream { lines, hold_open } => {
                let (tx, rx) = mpsc::channel();
                for line in lines {
                    // Receiver is alive in this scope
                    let _ = tx.send(format!("{}\n", line).into_bytes());
                }
                let closed = Arc::new(AtomicBool::new(false));
                if hold_open {
                    lock(&self.streams).push(OpenStream {
                        feed: tx,
                        closed: Arc::clone(&closed),
                    });
                } else {
                    drop(tx);
                    lock(&self.streams).push(OpenStream {
                        feed: mpsc::channel().0,
                        closed: Arc::clone(&closed),
                    });
                }

                Ok(Box::new(ScriptedSession {
                    reader: Some(ChannelReader {
                        rx,
                        closed: Arc::clone(&closed),
                        pending: Vec::new(),
                    }),
                    closed,
                    written: Arc::clone(&self.written),
                }))
            }
        }
    }

    fn execute(
        &self,
        _device: &DeviceHandle,
        session: &mut dyn Session,
        command_type: CommandType,
        command: &str,
    ) -> Result<(), ConnectionError> {
        lock(&self.commands).push((command_type, command.to_string()));
        session.write_line(command)
    }
}

/// Liveness probe whose answer is set by the caller
#[derive(Debug, Clone)]
pub struct ScriptedLivenessProbe {
    alive: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
}

impl ScriptedLivenessProbe {
    pub fn new(alive: bool) -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(alive)),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Number of probes answered so far
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl LivenessProbe for ScriptedLivenessProbe {
    fn is_alive(&self, _device: &DeviceHandle) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.alive.load(Ordering::SeqCst)
    }
}
