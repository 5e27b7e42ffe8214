/// Error types for the trace monitor
pub mod error;

/// Core trace types
pub mod events;

/// Device identity
pub mod device;

/// Configuration management
pub mod config;

/// Remote-command transport boundary
pub mod session;

/// Consecutive duplicate line filter
pub mod suppressor;

/// Trace line buffer with search mark
pub mod buffer;

/// Blocking pattern search over the buffer
pub mod search;

/// Per-device trace file
pub mod tracelog;

/// Connection state machine and reconnect budget
pub mod controller;

/// Trace read loop and health poller
pub mod collectors;

/// Per-device monitor exposing the trace API
pub mod monitor;

/// Monitor registry and process-wide tracing switch
pub mod registry;

// Re-export commonly used types
pub use config::Config;
pub use device::DeviceHandle;
pub use error::{ConfigError, ConnectionError, SearchError, TraceError, TraceLogError};
pub use events::{ConnectionState, SearchOutcome, TraceLine, TraceSource};
pub use monitor::TraceMonitor;
pub use registry::{MonitorRegistry, TracingSwitch};
