use thiserror::Error;

/// Errors raised while opening or driving a remote shell session
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Device {0} has no resolvable connection target")]
    NoTarget(String),

    #[error("Failed to open session: {0}")]
    ConnectFailed(String),

    #[error("Failed to execute command: {0}")]
    CommandFailed(String),

    #[error("Session stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors returned by trace searches
///
/// `InvalidPattern` and `InvalidTimeout` are caller bugs and are rejected before
/// any waiting happens. `NotRunning` means nothing is being collected, which is
/// distinct from a search that simply found no match in time.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid search pattern: {0}")]
    InvalidPattern(String),

    #[error("Search timeout must be greater than zero")]
    InvalidTimeout,

    #[error("Trace monitoring is not running: {0}")]
    NotRunning(String),
}

/// Errors that can occur during configuration loading
///
/// Read failures carry the path in their message; a file that reads but does
/// not parse is a `TomlError`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors from the per-device trace log file
#[derive(Error, Debug)]
pub enum TraceLogError {
    #[error("Trace log {path} reached {size_kb} KB (limit {limit_kb} KB)")]
    SizeLimitExceeded {
        path: String,
        size_kb: u64,
        limit_kb: u64,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors surfaced by the monitor API
#[derive(Error, Debug)]
pub enum TraceError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TraceLog(#[from] TraceLogError),

    #[error("Device {0} is on a serial trace rack")]
    SerialTraceRack(String),
}
