//! Device identity as seen by the trace monitor
//!
//! Devices are owned by an external inventory. The monitor only reads these
//! fields and never changes them.

use serde::{Deserialize, Serialize};

/// Test identifier used in trace prefixes when a device carries none
pub const DEFAULT_TEST_ID: &str = "TC-INIT-1000";

/// Role a device plays in a gateway/client topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// Stand-alone device or gateway; never cascades
    #[default]
    Gateway,
    /// Client whose trace is meaningful only alongside its gateway's trace
    Client,
}

/// Opaque identity of a device under test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Host MAC address, e.g. `AA:BB:CC:DD:EE:FF`
    pub mac: String,
    /// IPv4 address or host name used to reach the device
    pub ip: Option<String>,
    /// IPv6 address, used when no IPv4 address is known
    pub ipv6: Option<String>,
    /// Device model name
    pub model: String,
    /// Topology role
    #[serde(default)]
    pub role: DeviceRole,
    /// MAC of the linked gateway, for clients
    pub gateway_mac: Option<String>,
    /// Rack the device is mounted in
    pub rack: Option<String>,
    /// Identifier of the test currently driving the device
    pub test_id: Option<String>,
}

impl DeviceHandle {
    /// Create a gateway-role device with the given MAC, address and model
    pub fn new(mac: impl Into<String>, ip: Option<String>, model: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            ip,
            ipv6: None,
            model: model.into(),
            role: DeviceRole::Gateway,
            gateway_mac: None,
            rack: None,
            test_id: None,
        }
    }

    /// Turn this device into a client linked to `gateway_mac`
    pub fn with_gateway(mut self, gateway_mac: impl Into<String>) -> Self {
        self.role = DeviceRole::Client;
        self.gateway_mac = Some(gateway_mac.into());
        self
    }

    /// Identifier used as the registry key and in trace file names
    pub fn normalized_id(&self) -> String {
        normalize_mac(&self.mac)
    }

    /// Address to connect to, preferring IPv4
    pub fn connection_target(&self) -> Option<&str> {
        [self.ip.as_deref(), self.ipv6.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|addr| !addr.is_empty())
    }

    /// Whether operations on this device cascade to a linked gateway
    pub fn cascades_to_gateway(&self) -> bool {
        self.role == DeviceRole::Client && self.gateway_mac.is_some()
    }

    /// Test identifier for trace prefixes
    pub fn test_id(&self) -> &str {
        self.test_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(DEFAULT_TEST_ID)
    }
}

/// Strip separators from a MAC address and upper-case it
pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_id_strips_separators() {
        let device = DeviceHandle::new("aa:bb:cc:dd:ee:ff", None, "XB6");
        assert_eq!(device.normalized_id(), "AABBCCDDEEFF");
        assert_eq!(normalize_mac("AA-BB-CC-DD-EE-FF"), "AABBCCDDEEFF");
    }

    #[test]
    fn test_connection_target_prefers_ipv4() {
        let mut device = DeviceHandle::new("AA", Some("10.0.0.2".to_string()), "XB6");
        device.ipv6 = Some("fe80::1".to_string());
        assert_eq!(device.connection_target(), Some("10.0.0.2"));

        device.ip = Some("  ".to_string());
        assert_eq!(device.connection_target(), Some("fe80::1"));

        device.ipv6 = None;
        assert_eq!(device.connection_target(), None);
    }

    #[test]
    fn test_client_cascades_only_with_gateway() {
        let gateway = DeviceHandle::new("GW", Some("10.0.0.1".to_string()), "XG1");
        assert!(!gateway.cascades_to_gateway());

        let client = DeviceHandle::new("CL", Some("10.0.0.2".to_string()), "XI6").with_gateway("GW");
        assert!(client.cascades_to_gateway());
    }

    #[test]
    fn test_default_test_id() {
        let mut device = DeviceHandle::new("AA", None, "XB6");
        assert_eq!(device.test_id(), DEFAULT_TEST_ID);
        device.test_id = Some("TC-42".to_string());
        assert_eq!(device.test_id(), "TC-42");
    }
}
