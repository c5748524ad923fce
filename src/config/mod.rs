//! Configuration loading with Figment.
//!
//! A lab configuration is read from a TOML file and then overridden by
//! environment variables prefixed with `LABBRIDGE_`, where a double
//! underscore separates nesting levels:
//!
//! ```text
//! LABBRIDGE_APPLICATION__LOG_LEVEL=debug
//! LABBRIDGE_SESSION__QUEUE_CAPACITY=64
//! ```
//!
//! Each `[[devices]]` entry names a [`DeviceKind`] and a partial device
//! configuration. Missing fields are filled from the kind's factory
//! settings, so an MFC entry only needs its port.
//!
//! # Example
//! ```no_run
//! use labbridge::config::LabConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LabConfig::load_from("config/labbridge.toml")?;
//! config.validate()?;
//! for device in config.enabled_devices() {
//!     println!("{} -> {}", device.id, device.device_config()?.address());
//! }
//! # Ok(())
//! # }
//! ```

mod device;

pub use device::{
    DeviceConfig, DeviceKind, Parity, ProtocolKind, SerialSettings, TransportConfig,
    MODBUS_TCP_PORT,
};

use crate::error::{AppResult, DeviceError, ValidationError};
use crate::logging::OutputFormat;
use crate::session::SessionSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/labbridge.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    pub application: ApplicationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Session actor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Commands buffered per session before callers wait.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long disconnect waits for the in-flight command.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

/// One instrument in the lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Unique identifier, also used as the event label.
    pub id: String,
    pub kind: DeviceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Partial [`DeviceConfig`], merged over the kind's factory settings.
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn default_name() -> String {
    "labbridge".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    32
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            session: SessionConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            queue_capacity: self.queue_capacity.max(1),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }
}

impl DeviceEntry {
    /// Resolve the full device configuration for this entry.
    pub fn device_config(&self) -> AppResult<DeviceConfig> {
        let mut config: DeviceConfig = Figment::from(Serialized::defaults(
            self.kind.default_config(),
        ))
        .merge(Serialized::defaults(&self.config))
        .extract()
        .map_err(|e| invalid(format!("device '{}': {e}", self.id)))?;
        if config.label.is_none() {
            config.label = Some(self.id.clone());
        }
        Ok(config)
    }
}

impl LabConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABBRIDGE_").split("__"))
            .extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.session.queue_capacity == 0 {
            return Err(invalid("session.queue_capacity must be at least 1".to_string()));
        }

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for entry in &self.devices {
            if !ids.insert(entry.id.as_str()) {
                return Err(invalid(format!("Duplicate device ID: {}", entry.id)));
            }
            let config = entry.device_config()?;
            config.validate(entry.kind)?;
            if entry.enabled && !addresses.insert(config.address()) {
                return Err(invalid(format!(
                    "device '{}' shares address {} with another enabled device",
                    entry.id,
                    config.address()
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_devices(&self) -> Vec<&DeviceEntry> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }

    pub fn device(&self, id: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.id == id)
    }
}

fn invalid(message: String) -> DeviceError {
    ValidationError::InvalidConfig(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab(devices: &str) -> LabConfig {
        let toml_text = format!("[application]\nname = \"test\"\n{devices}");
        Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::string(&toml_text))
            .extract()
            .unwrap()
    }

    #[test]
    fn entries_inherit_factory_settings() {
        let config = lab(
            r#"
            [[devices]]
            id = "mfc-1"
            kind = "mass_flow_controller"
            config = { transport = { port = "/dev/ttyUSB0" } }
            "#,
        );
        assert!(config.validate().is_ok());
        let device = config.devices[0].device_config().unwrap();
        assert_eq!(device.label.as_deref(), Some("mfc-1"));
        match device.transport {
            TransportConfig::Serial(serial) => {
                assert_eq!(serial.port, "/dev/ttyUSB0");
                assert_eq!(serial.baud_rate, 38_400);
                assert_eq!(serial.parity, Parity::Even);
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn robot_arm_entry_takes_a_host() {
        let config = lab(
            r#"
            [[devices]]
            id = "arm"
            kind = "robot_arm"
            config = { transport = { host = "192.168.0.20" }, response_timeout = "3s" }
            "#,
        );
        let device = config.devices[0].device_config().unwrap();
        assert_eq!(device.address(), "192.168.0.20:502");
        assert_eq!(device.slave_id, 5);
        assert_eq!(device.response_timeout, Duration::from_secs(3));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let config = lab(
            r#"
            [[devices]]
            id = "a"
            kind = "heater"
            config = { transport = { port = "/dev/ttyS0" } }
            [[devices]]
            id = "a"
            kind = "laser"
            config = { transport = { port = "/dev/ttyS1" } }
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn shared_address_is_rejected() {
        let config = lab(
            r#"
            [[devices]]
            id = "heater"
            kind = "heater"
            config = { transport = { port = "/dev/ttyS0" } }
            [[devices]]
            id = "laser"
            kind = "laser"
            config = { transport = { port = "/dev/ttyS0" } }
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_log_level() {
        let mut config = LabConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_devices_are_skipped() {
        let config = lab(
            r#"
            [[devices]]
            id = "spare"
            kind = "ultrasonic"
            enabled = false
            config = { transport = { port = "/dev/ttyS3" } }
            "#,
        );
        assert!(config.enabled_devices().is_empty());
        assert!(config.device("spare").is_some());
    }
}
