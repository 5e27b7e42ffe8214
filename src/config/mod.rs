//! Configuration management
//!
//! Configuration is read from a TOML file with one table per concern. The four
//! flat property keys understood by the wider test framework are accepted too,
//! through [`Config::from_properties`].

/// Secondary console stream configuration
pub mod additional;

pub use additional::AdditionalLoggerSpec;

use crate::device::DeviceHandle;
use crate::error::ConfigError;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Property key for the consecutive duplicate line cap
pub const DUPLICATE_LINE_LIMIT_KEY: &str = "duplicate.line.limit";
/// Property key for the trace file size cap, in KB
pub const TRACE_SIZE_LIMIT_KEY: &str = "trace.size.limit";
/// Property key for the secondary console stream, `model,name,util,command`
pub const ADDITIONAL_TRACE_SUPPORT_KEY: &str = "additional.trace.support";
/// Property key for the comma separated racks that use serial trace
pub const SERIAL_TRACE_RACKS_KEY: &str = "enable.serial.trace.logger.racks";

/// Default consecutive duplicate line cap
pub const DEFAULT_DUPLICATE_LINE_LIMIT: usize = 100;
/// Default trace file size cap (200 MB)
pub const DEFAULT_SIZE_LIMIT_KB: u64 = 204_800;
/// Default reconnect budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 500;

/// Top level configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub trace: TraceSettings,
    pub reconnect: ReconnectSettings,
    pub health: HealthSettings,
    pub search: SearchSettings,
    pub connection: ConnectionSettings,
}

/// Trace collection and persistence
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TraceSettings {
    /// Directory holding one trace file per device
    pub directory: PathBuf,
    /// Consecutive identical lines admitted before suppression starts
    pub duplicate_line_limit: usize,
    /// Trace file size cap in KB; tracing stops for the device beyond it
    pub size_limit_kb: u64,
    /// Secondary console stream, `model,name,util,command`
    pub additional_trace_support: Option<String>,
    /// Racks whose devices are traced over serial instead
    pub serial_trace_racks: Vec<String>,
    /// Turn buffering on when trace starts
    pub buffer_on_start: bool,
    /// Invoke the crash hook for every admitted line
    pub crash_analysis: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("target/settoptrace"),
            duplicate_line_limit: DEFAULT_DUPLICATE_LINE_LIMIT,
            size_limit_kb: DEFAULT_SIZE_LIMIT_KB,
            additional_trace_support: None,
            serial_trace_racks: Vec::new(),
            buffer_on_start: false,
            crash_analysis: false,
        }
    }
}

/// Reconnect budget and pacing
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Connect attempts allowed before the monitor gives up
    pub max_attempts: u32,
    /// Wait between failed connect attempts
    pub retry_delay_ms: u64,
    /// Wait after a reconnect before reading, lets the device settle
    pub settle_delay_ms: u64,
    /// Upper bound on joining worker threads during stop
    pub stop_join_timeout_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: 10_000,
            settle_delay_ms: 30_000,
            stop_join_timeout_ms: 5_000,
        }
    }
}

impl ReconnectSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_join_timeout_ms)
    }
}

/// Liveness polling cadence
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    /// Probe interval while the connection looks healthy
    pub interval_ms: u64,
    /// Probe interval while a loss is suspected
    pub suspect_interval_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            suspect_interval_ms: 30_000,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn suspect_interval(&self) -> Duration {
        Duration::from_millis(self.suspect_interval_ms)
    }
}

/// Trace search tuning
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchSettings {
    /// Longest a search sleeps between buffer checks
    pub poll_interval_ms: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}

impl SearchSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Response written back when the session shows an interactive prompt
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PromptRule {
    /// Regex matched against each line read from the session
    pub pattern: String,
    /// Text written back, followed by a newline
    pub response: String,
}

/// Remote shell transport used by the process-backed provider
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Program opening the remote shell
    pub shell: String,
    /// Arguments; `{host}` is replaced with the device address
    pub shell_args: Vec<String>,
    /// Trace start command issued on the session
    pub trace_command: String,
    /// Per-model overrides of `trace_command`
    pub trace_commands: HashMap<String, String>,
    /// Liveness probe; `{host}` is replaced with the device address
    pub probe_command: Vec<String>,
    /// Interactive prompts answered by the collector
    pub prompts: Vec<PromptRule>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            shell: "ssh".to_string(),
            shell_args: vec![
                "-tt".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "root@{host}".to_string(),
            ],
            trace_command: "journalctl -f".to_string(),
            trace_commands: HashMap::new(),
            probe_command: vec![
                "ping".to_string(),
                "-c".to_string(),
                "1".to_string(),
                "-W".to_string(),
                "2".to_string(),
                "{host}".to_string(),
            ],
            prompts: Vec::new(),
        }
    }
}

impl ConnectionSettings {
    /// Trace start command for a device model
    pub fn trace_command_for(&self, model: &str) -> &str {
        self.trace_commands
            .get(model)
            .map(String::as_str)
            .unwrap_or(&self.trace_command)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read, a TOML error if
    /// it does not parse, and `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from the framework's flat property keys
    ///
    /// Unknown keys are ignored. Numeric values that do not parse fall back to
    /// their defaults with a warning rather than failing.
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        let mut config = Config::default();

        if let Some(raw) = properties.get(DUPLICATE_LINE_LIMIT_KEY) {
            match raw.trim().parse::<usize>() {
                Ok(limit) => config.trace.duplicate_line_limit = limit,
                Err(e) => warn!(
                    "Ignoring {}={:?} ({}), using {}",
                    DUPLICATE_LINE_LIMIT_KEY, raw, e, DEFAULT_DUPLICATE_LINE_LIMIT
                ),
            }
        }

        if let Some(raw) = properties.get(TRACE_SIZE_LIMIT_KEY) {
            // The framework writes this one as a float at times
            match raw.trim().parse::<f64>() {
                Ok(kb) if kb > 0.0 => config.trace.size_limit_kb = kb as u64,
                _ => warn!(
                    "Ignoring {}={:?}, using {} KB",
                    TRACE_SIZE_LIMIT_KEY, raw, DEFAULT_SIZE_LIMIT_KB
                ),
            }
        }

        if let Some(raw) = properties.get(ADDITIONAL_TRACE_SUPPORT_KEY) {
            config.trace.additional_trace_support = Some(raw.clone());
        }

        if let Some(raw) = properties.get(SERIAL_TRACE_RACKS_KEY) {
            config.trace.serial_trace_racks = raw
                .split(',')
                .map(str::trim)
                .filter(|rack| !rack.is_empty())
                .map(str::to_string)
                .collect();
        }

        debug!("Configuration built from properties: {:?}", config.trace);
        config
    }

    /// Check values that would make the monitor misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trace.size_limit_kb == 0 {
            return Err(ConfigError::ValidationError(
                "trace.size_limit_kb must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.health.interval_ms == 0 || self.health.suspect_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health intervals must be greater than zero".to_string(),
            ));
        }
        if self.search.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "search.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.connection.shell.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "connection.shell cannot be empty".to_string(),
            ));
        }
        for rule in &self.connection.prompts {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                ConfigError::ValidationError(format!("prompt pattern {:?}: {}", rule.pattern, e))
            })?;
        }
        Ok(())
    }

    /// Secondary console stream configured for this device's model, if any
    pub fn additional_logger_for(&self, device: &DeviceHandle) -> Option<AdditionalLoggerSpec> {
        self.trace
            .additional_trace_support
            .as_deref()
            .and_then(AdditionalLoggerSpec::parse)
            .filter(|spec| spec.applies_to(device))
    }

    /// Whether the device is traced over serial rather than a shell session
    pub fn uses_serial_trace(&self, device: &DeviceHandle) -> bool {
        device
            .rack
            .as_deref()
            .map(|rack| self.trace.serial_trace_racks.iter().any(|r| r == rack))
            .unwrap_or(false)
    }
}
