//! Boundary to the remote-command transport
//!
//! The monitor never talks to a device directly. It asks a [`ConnectionProvider`]
//! for a [`Session`], issues the trace start command through it and then reads
//! the session's output stream. Liveness checks and crash analysis are external
//! collaborators too.

/// Process-backed transport and probe
pub mod process;

/// Automatic answers to interactive prompts
pub mod prompt;

/// In-memory transport replaying a script
pub mod scripted;

pub use process::{CommandLivenessProbe, ProcessConnectionProvider, ProcessSession};
pub use prompt::PromptResponder;
pub use scripted::{ScriptedConnect, ScriptedConnectionProvider, ScriptedLivenessProbe};

use crate::device::DeviceHandle;
use crate::error::ConnectionError;
use crate::events::TraceLine;
use std::io::{Read, Write};

#[cfg(test)]
use mockall::automock;

/// Kind of command issued on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Starts the primary trace stream
    TraceInit,
    /// Starts the secondary console stream
    AdditionalTraceInit,
}

/// Open remote shell session
///
/// Readers and writers are handed out once. Disconnecting must unblock any
/// thread blocked reading from the session's output.
pub trait Session: Send {
    /// Write one line of input to the remote shell
    fn write_line(&mut self, line: &str) -> Result<(), ConnectionError>;

    /// Take the output stream
    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Take the input stream
    fn take_writer(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Close the session and release local resources
    fn disconnect(&mut self) -> Result<(), ConnectionError>;
}

/// Opens sessions and runs commands on them
pub trait ConnectionProvider: Send + Sync {
    /// Open a new session to `device`
    fn get_connection(&self, device: &DeviceHandle) -> Result<Box<dyn Session>, ConnectionError>;

    /// Issue `command` on `session`
    fn execute(
        &self,
        device: &DeviceHandle,
        session: &mut dyn Session,
        command_type: CommandType,
        command: &str,
    ) -> Result<(), ConnectionError>;

    /// Remove trace processes left behind by earlier runs
    fn cleanup_device_trace(&self, _device: &DeviceHandle) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Lightweight check that a device is reachable
#[cfg_attr(test, automock)]
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, device: &DeviceHandle) -> bool;
}

/// Crash analysis callback, invoked for every admitted line when enabled
#[cfg_attr(test, automock)]
pub trait CrashHook: Send + Sync {
    fn on_line(&self, device: &DeviceHandle, line: &TraceLine) -> anyhow::Result<()>;
}
