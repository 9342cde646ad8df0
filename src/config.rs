//! Engine configuration and the device registry it feeds.
//!
//! ```toml
//! connect_timeout_ms = 5000
//! response_timeout_ms = 30000
//!
//! [receiver]
//! port = 2576
//!
//! [[devices]]
//! id = "cobas-1"
//! host = "10.0.0.21"
//! port = 5100
//! role = "client"
//! ```

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::error::{Hl7Error, Result};

pub const DEFAULT_RECEIVER_PORT: u16 = 2576;

/// Top level configuration for a [`ConnectionManager`](crate::ConnectionManager) and
/// [`ReceiverService`](crate::ReceiverService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub receiver: ReceiverConfig,
    /// Outbound connect timeout
    pub connect_timeout_ms: u64,
    /// How long a worklist waits for its acknowledgment
    pub response_timeout_ms: u64,
    /// Bytes buffered from one peer without an end block before giving up on it
    pub max_frame_len: usize,
    /// Events a slow subscriber may fall behind by before it starts missing some
    pub event_capacity: usize,
    pub devices: Vec<DeviceConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            receiver: ReceiverConfig::default(),
            connect_timeout_ms: 5_000,
            response_timeout_ms: 30_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            event_capacity: 256,
            devices: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| Hl7Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Hl7Error::config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_len == 0 {
            return Err(Hl7Error::config("max_frame_len must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(Hl7Error::config("event_capacity must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(Hl7Error::config("device id cannot be empty"));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(Hl7Error::config(format!("duplicate device id {}", device.id)));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// The process-wide listener for unsolicited results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_RECEIVER_PORT,
        }
    }
}

/// Which side of the TCP connection we play for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// We listen, the analyzer connects to us
    Server,
    /// We connect out to the analyzer
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub role: DeviceRole,
}

/// Where and how to reach an analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub role: DeviceRole,
}

/// Device addressing, owned by the host application.
pub trait DeviceRegistry: Send + Sync {
    fn lookup(&self, device_id: &str) -> Option<DeviceEndpoint>;
}

/// A [`DeviceRegistry`] fixed at startup, typically from the `[[devices]]` table.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceRegistry {
    devices: HashMap<String, DeviceEndpoint>,
}

impl StaticDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        for device in &config.devices {
            registry.insert(
                device.id.clone(),
                DeviceEndpoint {
                    host: device.host.clone(),
                    port: device.port,
                    role: device.role,
                },
            );
        }
        registry
    }

    pub fn insert(&mut self, device_id: impl Into<String>, endpoint: DeviceEndpoint) {
        self.devices.insert(device_id.into(), endpoint);
    }
}

impl DeviceRegistry for StaticDeviceRegistry {
    fn lookup(&self, device_id: &str) -> Option<DeviceEndpoint> {
        self.devices.get(device_id).cloned()
    }
}
