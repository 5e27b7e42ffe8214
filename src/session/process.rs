use super::{CommandType, ConnectionProvider, LivenessProbe, Session};
use crate::config::ConnectionSettings;
use crate::device::DeviceHandle;
use crate::error::ConnectionError;
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Replace `{host}` placeholders in `args`
fn expand_args(args: &[String], host: &str) -> Vec<String> {
    args.iter().map(|arg| arg.replace("{host}", host)).collect()
}

fn target_of(device: &DeviceHandle) -> Result<&str, ConnectionError> {
    device
        .connection_target()
        .ok_or_else(|| ConnectionError::NoTarget(device.mac.clone()))
}

/// Session backed by a local remote-shell subprocess (`ssh`, `telnet`, ...)
///
/// Killing the subprocess closes its output pipe, which unblocks readers.
pub struct ProcessSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    closed: bool,
}

impl ProcessSession {
    /// Spawn `program` with `args`, piping its stdin and stdout
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, ConnectionError> {
        debug!("Spawning session: {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ConnectionError::ConnectFailed(format!("{}: {}", program, e)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Self {
            child,
            stdin,
            stdout,
            closed: false,
        })
    }

    /// OS process id of the session
    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Session for ProcessSession {
    fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ConnectionError::StreamUnavailable("stdin already taken".to_string()))?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout
            .take()
            .map(|stdout| Box::new(stdout) as Box<dyn Read + Send>)
    }

    fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>)
    }

    fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stdin = None;
        self.stdout = None;

        if let Err(e) = self.child.kill() {
            // Already exited
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("Failed to kill session process {}: {}", self.child.id(), e);
            }
        }
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Connection provider spawning one remote-shell subprocess per session
#[derive(Debug, Clone)]
pub struct ProcessConnectionProvider {
    settings: ConnectionSettings,
}

impl ProcessConnectionProvider {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

impl ConnectionProvider for ProcessConnectionProvider {
    fn get_connection(&self, device: &DeviceHandle) -> Result<Box<dyn Session>, ConnectionError> {
        let host = target_of(device)?;
        let args = expand_args(&self.settings.shell_args, host);
        let session = ProcessSession::spawn(&self.settings.shell, &args)?;
        info!(
            "Opened session {} to {} ({})",
            session.id(),
            device.mac,
            host
        );
        Ok(Box::new(session))
    }

    fn execute(
        &self,
        device: &DeviceHandle,
        session: &mut dyn Session,
        command_type: CommandType,
        command: &str,
    ) -> Result<(), ConnectionError> {
        debug!("Executing {:?} on {}: {}", command_type, device.mac, command);
        session
            .write_line(command)
            .map_err(|e| ConnectionError::CommandFailed(format!("{}: {}", command, e)))
    }
}

/// Liveness probe running a local command, `ping` by default
#[derive(Debug, Clone)]
pub struct CommandLivenessProbe {
    command: Vec<String>,
}

impl CommandLivenessProbe {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl LivenessProbe for CommandLivenessProbe {
    fn is_alive(&self, device: &DeviceHandle) -> bool {
        let Some(host) = device.connection_target() else {
            warn!("Cannot probe {}: no connection target", device.mac);
            return false;
        };
        let Some((program, args)) = self.command.split_first() else {
            warn!("Liveness probe command is empty");
            return false;
        };

        match Command::new(program)
            .args(expand_args(args, host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => {
                debug!("Probe of {} exited with {}", device.mac, status);
                status.success()
            }
            Err(e) => {
                warn!("Failed to run liveness probe {}: {}", program, e);
                false
            }
        }
    }
}
