use crate::device::DeviceHandle;
use log::{debug, info};

/// Secondary console stream read alongside the primary trace
///
/// Configured as `model,name,util,command`. Only devices of `model` get the
/// extra stream; its lines are tagged with `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalLoggerSpec {
    /// Device model the stream applies to
    pub model: String,
    /// Tag used for lines from this stream
    pub name: String,
    /// Utility used to reach the console (informational)
    pub utility: String,
    /// Command issued on the secondary session
    pub command: String,
}

impl AdditionalLoggerSpec {
    /// Parse a `model,name,util,command` value
    ///
    /// Anything other than exactly four fields disables the stream.
    pub fn parse(raw: &str) -> Option<Self> {
        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        if fields.len() != 4 || fields.iter().any(|f| f.is_empty()) {
            debug!("Additional trace support disabled, unusable value {:?}", raw);
            return None;
        }

        Some(Self {
            model: fields[0].to_string(),
            name: fields[1].to_string(),
            utility: fields[2].to_string(),
            command: fields[3].to_string(),
        })
    }

    /// Whether the stream is enabled for `device`
    pub fn applies_to(&self, device: &DeviceHandle) -> bool {
        let applies = device.model == self.model;
        if applies {
            info!(
                "Additional trace '{}' enabled for {} ({})",
                self.name, device.mac, device.model
            );
        }
        applies
    }
}
