//! # Configuration
//!
//! Session and discovery settings, loadable from TOML or built in code.
//!
//! A config file lists one `[[device]]` table per appliance plus an optional
//! `[discovery]` table:
//!
//! ```toml
//! [discovery]
//! broadcast_address = "255.255.255.255"
//! timeout_ms = 5000
//!
//! [[device]]
//! name = "living room ac"
//! device_id = 123456789
//! ip = "192.168.1.40"
//! token = "ab…"   # 128 hex chars
//! key = "cd…"     # 64 hex chars
//! ```
//!
//! Validation collects every problem instead of stopping at the first, so a
//! config file round-trip reports all mistakes at once.

use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{constants, LanError, Result};

/// Default TCP control port.
pub const CONTROL_PORT: u16 = 6444;

/// Default UDP discovery port.
pub const DISCOVERY_PORT: u16 = 6445;

/// Decoded pairing credentials for a protocol-v3 device.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub token: [u8; 64],
    pub key: [u8; 32],
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

/// Everything one device session needs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Display name used in logs.
    pub name: String,

    /// Device id learned from discovery or the vendor app.
    pub device_id: u64,

    /// Device address, IPv4 or IPv6.
    pub ip: String,

    /// TCP control port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pairing token, 128 hex characters. Required for protocol 3.
    #[serde(default)]
    pub token: String,

    /// Pairing key, 64 hex characters. Required for protocol 3.
    #[serde(default)]
    pub key: String,

    /// Protocol version, 2 or 3.
    #[serde(default = "default_protocol")]
    pub protocol: u8,

    /// How often the session queries device status.
    #[serde(
        default = "default_refresh_interval",
        rename = "refresh_interval_ms",
        with = "duration_serde"
    )]
    pub refresh_interval: Duration,

    /// How often the session sends a keepalive.
    #[serde(
        default = "default_heartbeat_interval",
        rename = "heartbeat_interval_ms",
        with = "duration_serde"
    )]
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            device_id: 0,
            ip: String::new(),
            port: default_port(),
            token: String::new(),
            key: String::new(),
            protocol: default_protocol(),
            refresh_interval: default_refresh_interval(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

impl SessionConfig {
    /// Validate, collecting every problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("device name cannot be empty".to_string());
        }

        if self.ip.parse::<IpAddr>().is_err() {
            errors.push(format!("invalid device address: '{}'", self.ip));
        }

        if self.port == 0 {
            errors.push("control port cannot be 0".to_string());
        }

        if self.protocol != 2 && self.protocol != 3 {
            errors.push(format!(
                "unsupported protocol version: {} (expected 2 or 3)",
                self.protocol
            ));
        }

        if self.protocol == 3 {
            if self.token.len() != 128 || hex::decode(&self.token).is_err() {
                errors.push("token must be 128 hex characters".to_string());
            }
            if self.key.len() != 64 || hex::decode(&self.key).is_err() {
                errors.push("key must be 64 hex characters".to_string());
            }
        }

        if self.refresh_interval < Duration::from_secs(1) {
            errors.push("refresh interval too short (minimum: 1s)".to_string());
        } else if self.refresh_interval > Duration::from_secs(3600) {
            errors.push("refresh interval too long (maximum: 1 hour)".to_string());
        }

        if self.heartbeat_interval < Duration::from_secs(1) {
            errors.push("heartbeat interval too short (minimum: 1s)".to_string());
        } else if self.heartbeat_interval > Duration::from_secs(600) {
            errors.push("heartbeat interval too long (maximum: 10 minutes)".to_string());
        }

        errors
    }

    /// Validate and return the first failure as an error.
    pub fn validate_strict(&self) -> Result<()> {
        collect_errors(self.validate())
    }

    /// Decode the hex credentials. `Ok(None)` for protocol 2, which has no
    /// handshake.
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        if self.protocol != 3 {
            return Ok(None);
        }

        let token_bytes = hex::decode(&self.token)
            .map_err(|_| LanError::Config("token is not valid hex".to_string()))?;
        let key_bytes = hex::decode(&self.key)
            .map_err(|_| LanError::Config("key is not valid hex".to_string()))?;

        let token: [u8; 64] = token_bytes
            .try_into()
            .map_err(|_| LanError::Config(constants::ERR_MISSING_CREDENTIALS.to_string()))?;
        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| LanError::Config(constants::ERR_MISSING_CREDENTIALS.to_string()))?;

        Ok(Some(Credentials { token, key }))
    }
}

/// Discovery socket settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Probe destination; the IPv4 broadcast address by default.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,

    /// Probe destination port.
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// How long to collect responses before returning.
    #[serde(
        default = "default_discovery_timeout",
        rename = "timeout_ms",
        with = "duration_serde"
    )]
    pub timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_address: default_broadcast_address(),
            port: default_discovery_port(),
            timeout: default_discovery_timeout(),
        }
    }
}

impl DiscoveryConfig {
    /// Validate, collecting every problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.broadcast_address.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "invalid broadcast address: '{}'",
                self.broadcast_address
            ));
        }

        if self.port == 0 {
            errors.push("discovery port cannot be 0".to_string());
        }

        if self.timeout < Duration::from_millis(100) {
            errors.push("discovery timeout too short (minimum: 100ms)".to_string());
        } else if self.timeout > Duration::from_secs(60) {
            errors.push("discovery timeout too long (maximum: 60s)".to_string());
        }

        errors
    }

    /// Validate and return the first failure as an error.
    pub fn validate_strict(&self) -> Result<()> {
        collect_errors(self.validate())
    }
}

/// Top-level configuration: discovery settings plus one entry per device.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LanConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default, rename = "device")]
    pub devices: Vec<SessionConfig>,
}

impl LanConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| LanError::Config(format!("failed to open config file: {e}")))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| LanError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| LanError::Config(format!("failed to parse TOML: {e}")))
    }

    /// Validate every section, collecting every problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.discovery.validate();
        for device in &self.devices {
            for problem in device.validate() {
                errors.push(format!("{}: {}", device.name, problem));
            }
        }
        errors
    }

    /// Validate and return all failures as one error.
    pub fn validate_strict(&self) -> Result<()> {
        collect_errors(self.validate())
    }
}

fn collect_errors(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(LanError::Config(format!(
            "validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn default_port() -> u16 {
    CONTROL_PORT
}

fn default_protocol() -> u8 {
    3
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

fn default_discovery_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Helper module for Duration serialization as milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
