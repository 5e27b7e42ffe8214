//! Per-process registry of device monitors
//!
//! Owns one [`TraceMonitor`] per device, keyed by normalized MAC, and the
//! process-wide switch that disables all tracing. Client monitors are linked to
//! their gateway's monitor as either side registers.

use crate::config::Config;
use crate::device::{normalize_mac, DeviceHandle};
use crate::error::TraceError;
use crate::monitor::TraceMonitor;
use crate::session::{ConnectionProvider, CrashHook, LivenessProbe};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Process-wide switch consulted by every monitor before trace operations
#[derive(Debug, Clone)]
pub struct TracingSwitch(Arc<AtomicBool>);

impl Default for TracingSwitch {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl TracingSwitch {
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.0.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(
                "Device tracing {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }
}

/// Owner of all device monitors in the process
pub struct MonitorRegistry {
    config: Config,
    provider: Arc<dyn ConnectionProvider>,
    probe: Arc<dyn LivenessProbe>,
    crash_hook: Option<Arc<dyn CrashHook>>,
    switch: TracingSwitch,
    monitors: Mutex<HashMap<String, Arc<TraceMonitor>>>,
}

impl MonitorRegistry {
    pub fn new(
        config: Config,
        provider: Arc<dyn ConnectionProvider>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            config,
            provider,
            probe,
            crash_hook: None,
            switch: TracingSwitch::default(),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a crash analysis hook to monitors registered from now on
    pub fn with_crash_hook(mut self, hook: Arc<dyn CrashHook>) -> Self {
        self.crash_hook = Some(hook);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TraceMonitor>>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle to the process-wide tracing switch
    pub fn tracing_switch(&self) -> TracingSwitch {
        self.switch.clone()
    }

    /// Monitor for `device`, created on first registration
    ///
    /// # Errors
    ///
    /// Returns `TraceError::SerialTraceRack` for devices traced over serial, and
    /// configuration errors from building the monitor.
    pub fn register(&self, device: DeviceHandle) -> Result<Arc<TraceMonitor>, TraceError> {
        let id = device.normalized_id();
        let mut monitors = self.lock();
        if let Some(existing) = monitors.get(&id) {
            return Ok(Arc::clone(existing));
        }

        let monitor = Arc::new(TraceMonitor::new(
            device,
            &self.config,
            Arc::clone(&self.provider),
            Arc::clone(&self.probe),
            self.crash_hook.clone(),
            self.switch.clone(),
        )?);

        // Client registered after its gateway
        if let Some(gateway_mac) = monitor.device().gateway_mac.as_deref() {
            if let Some(gateway) = monitors.get(&normalize_mac(gateway_mac)) {
                monitor.link_gateway(gateway);
            }
        }
        // Gateway registered after its clients
        for client in monitors.values() {
            let serves = client
                .device()
                .gateway_mac
                .as_deref()
                .map_or(false, |mac| normalize_mac(mac) == id);
            if serves {
                client.link_gateway(&monitor);
            }
        }

        debug!("Registered trace monitor for {}", id);
        monitors.insert(id, Arc::clone(&monitor));
        Ok(monitor)
    }

    pub fn get(&self, mac: &str) -> Option<Arc<TraceMonitor>> {
        self.lock().get(&normalize_mac(mac)).cloned()
    }

    /// Remove a device's monitor, stopping its trace
    pub fn remove(&self, mac: &str) -> Option<Arc<TraceMonitor>> {
        let removed = self.lock().remove(&normalize_mac(mac));
        if let Some(monitor) = &removed {
            monitor.shutdown();
            debug!("Removed trace monitor for {}", monitor.device().mac);
        }
        removed
    }

    /// Stop every monitor, ignoring the tracing switch
    pub fn stop_all(&self) {
        let monitors: Vec<Arc<TraceMonitor>> = self.lock().values().cloned().collect();
        info!("Stopping {} trace monitors", monitors.len());
        for monitor in monitors {
            monitor.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
