use anyhow::{bail, Context};
use clap::Parser;
use devtrace::config::Config;
use devtrace::device::DeviceHandle;
use devtrace::error::ConfigError;
use devtrace::registry::MonitorRegistry;
use devtrace::session::{CommandLivenessProbe, ProcessConnectionProvider};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Command-line arguments for the device trace monitor
#[derive(Parser)]
#[command(
    name = "devtrace",
    about = "Device trace monitor - keeps a remote trace stream alive and searches it",
    long_about = "Connects to an embedded device over a remote shell, keeps its trace stream \
                  running across connection drops, persists it to a per-device trace file and \
                  optionally waits for a line matching a pattern."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Device MAC address
    #[arg(long)]
    mac: String,

    /// Device IP address or host name
    #[arg(long)]
    host: String,

    /// Device model
    #[arg(long, default_value = "generic")]
    model: String,

    /// Test identifier used in trace file prefixes
    #[arg(long)]
    test_id: Option<String>,

    /// MAC of the gateway this device is a client of
    #[arg(long, requires = "gateway_host")]
    gateway_mac: Option<String>,

    /// Gateway IP address or host name
    #[arg(long, requires = "gateway_mac")]
    gateway_host: Option<String>,

    /// Gateway model
    #[arg(long, default_value = "generic")]
    gateway_model: String,

    /// Wait for a trace line matching this regex, then exit
    #[arg(long, value_name = "REGEX")]
    wait_for: Option<String>,

    /// How long to wait for `--wait-for`
    #[arg(long, default_value_t = 60_000)]
    timeout_ms: u64,
}

impl Cli {
    /// Validate the CLI arguments
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() && !config_path.is_file() {
                return Err(format!(
                    "Configuration path is not a file: {}",
                    config_path.display()
                ));
            }
        }
        if self.mac.trim().is_empty() {
            return Err("--mac cannot be empty".to_string());
        }
        if self.wait_for.is_some() && self.timeout_ms == 0 {
            return Err("--timeout-ms must be greater than zero".to_string());
        }
        Ok(())
    }

    fn device(&self) -> DeviceHandle {
        let mut device = DeviceHandle::new(&self.mac, Some(self.host.clone()), &self.model);
        device.test_id = self.test_id.clone();
        if let Some(gateway_mac) = &self.gateway_mac {
            device = device.with_gateway(gateway_mac);
        }
        device
    }

    fn gateway(&self) -> Option<DeviceHandle> {
        let mac = self.gateway_mac.as_ref()?;
        let mut gateway = DeviceHandle::new(mac, self.gateway_host.clone(), &self.gateway_model);
        gateway.test_id = self.test_id.clone();
        Some(gateway)
    }
}

/// Load configuration, falling back to defaults when the file is missing or invalid
fn load_config(config_path: Option<&Path>) -> Config {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::from_file(path) {
                Ok(config) => config,
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Configuration file '{}' not found or unreadable, using defaults",
                        path.display()
                    );
                    Config::default()
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path.display(), e);
                    warn!("Using default configuration due to invalid config file");
                    Config::default()
                }
            }
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    }
}

fn run(cli: &Cli, registry: &MonitorRegistry) -> anyhow::Result<()> {
    if let Some(gateway) = cli.gateway() {
        registry
            .register(gateway)
            .context("Failed to register gateway")?;
    }
    let monitor = registry
        .register(cli.device())
        .context("Failed to register device")?;

    if cli.wait_for.is_some() {
        monitor.start_buffering();
    }
    monitor.start_trace().context("Failed to start trace")?;
    info!(
        "Tracing {} ({}), status {}",
        cli.mac,
        cli.host,
        monitor.get_trace_status()
    );

    if let Some(pattern) = &cli.wait_for {
        let timeout = Duration::from_millis(cli.timeout_ms);
        let found = monitor
            .search_and_wait_for_trace(pattern, timeout, true, true, true)
            .context("Trace search failed")?;
        return match found {
            Some(line) => {
                println!("{}", line);
                Ok(())
            }
            None => bail!("No trace line matched {:?} within {:?}", pattern, timeout),
        };
    }

    let (shutdown_sender, shutdown_receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    info!("Device trace monitor is running. Press Ctrl+C to stop.");
    let _ = shutdown_receiver.recv();

    if let Some(failure) = monitor.last_failure() {
        warn!("Last connection failure at {}: {}", failure.at, failure.reason);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting device trace monitor");

    if let Err(e) = cli.validate() {
        bail!("Invalid arguments: {}", e);
    }

    let config = load_config(cli.config.as_deref());
    let registry = MonitorRegistry::new(
        config.clone(),
        Arc::new(ProcessConnectionProvider::new(config.connection.clone())),
        Arc::new(CommandLivenessProbe::new(config.connection.probe_command.clone())),
    );

    let result = run(&cli, &registry);
    registry.stop_all();
    info!("Device trace monitor shutdown complete");
    result
}
