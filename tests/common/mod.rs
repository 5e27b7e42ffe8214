#![allow(dead_code)]

use devtrace::config::Config;
use devtrace::device::DeviceHandle;
use devtrace::events::TraceLine;
use devtrace::registry::MonitorRegistry;
use devtrace::session::{
    CrashHook, ScriptedConnect, ScriptedConnectionProvider, ScriptedLivenessProbe,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const CLIENT_MAC: &str = "AA:BB:CC:DD:EE:01";
pub const GATEWAY_MAC: &str = "AA:BB:CC:DD:EE:FF";

/// Configuration with every delay shortened for tests
pub fn fast_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.trace.directory = dir.to_path_buf();
    config.trace.buffer_on_start = true;
    config.reconnect.retry_delay_ms = 0;
    config.reconnect.settle_delay_ms = 0;
    config.reconnect.stop_join_timeout_ms = 2_000;
    config.health.interval_ms = 20;
    config.health.suspect_interval_ms = 10;
    config.search.poll_interval_ms = 10;
    config
}

pub fn device(mac: &str) -> DeviceHandle {
    DeviceHandle::new(mac, Some("192.168.100.10".to_string()), "XB6")
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub provider: Arc<ScriptedConnectionProvider>,
    pub probe: ScriptedLivenessProbe,
    pub registry: MonitorRegistry,
}

impl Harness {
    pub fn new(script: Vec<ScriptedConnect>) -> Self {
        Self::with_config(script, |_| {})
    }

    pub fn with_config(script: Vec<ScriptedConnect>, adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(script, None, adjust)
    }

    pub fn build(
        script: Vec<ScriptedConnect>,
        crash_hook: Option<Arc<dyn CrashHook>>,
        adjust: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path());
        adjust(&mut config);

        let provider = Arc::new(ScriptedConnectionProvider::with_script(script));
        let probe = ScriptedLivenessProbe::new(true);
        let mut registry =
            MonitorRegistry::new(config, provider.clone(), Arc::new(probe.clone()));
        if let Some(hook) = crash_hook {
            registry = registry.with_crash_hook(hook);
        }
        Self {
            dir,
            provider,
            probe,
            registry,
        }
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Crash hook keeping every line it is shown
#[derive(Default)]
pub struct RecordingHook {
    pub lines: Mutex<Vec<TraceLine>>,
}

impl RecordingHook {
    pub fn texts(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|line| line.text.clone())
            .collect()
    }
}

impl CrashHook for RecordingHook {
    fn on_line(&self, _device: &DeviceHandle, line: &TraceLine) -> anyhow::Result<()> {
        self.lines.lock().unwrap().push(line.clone());
        Ok(())
    }
}
