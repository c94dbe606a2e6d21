//! Daemon configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a YAML file (`config/labd.yaml` by default)
//! 2. environment variables prefixed with `LABD_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use labd::config::DaemonConfig;
//!
//! let config = DaemonConfig::load_from("config/labd.yaml")?;
//! println!("Daemon endpoint: {}", config.daemon.address);
//! # Ok::<(), figment::Error>(())
//! ```
//!
//! `LABD_DAEMON__LOG_LEVEL=debug` overrides `daemon.log_level`.

use crate::error::{AppResult, LabError};
use crate::hardware::instrument::DeviceType;
use crate::hardware::registry::DriverRegistry;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file looked up by the CLI.
pub const DEFAULT_CONFIG_PATH: &str = "config/labd.yaml";

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Process-level settings
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// Instrument definitions, in the order they are reported to clients
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Settings for the daemon process itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Request/response endpoint
    #[serde(default = "default_address")]
    pub address: String,
    /// Holds the PID marker and the detached daemon's log
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Root directory for measurement output
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Send/receive deadline used by clients
    #[serde(with = "humantime_serde", default = "default_client_timeout")]
    pub client_timeout: Duration,
    /// Slots in the sequence status broadcast channel
    #[serde(default = "default_status_channel_capacity")]
    pub status_channel_capacity: usize,
}

/// One configured instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique instrument name
    pub name: String,
    /// Capability type (e.g. `power_supply`)
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Driver identifier (e.g. `tdklambda.zup`)
    pub driver: String,
    /// Driver-specific arguments
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

fn default_address() -> String {
    "127.0.0.1:14337".to_string()
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from(".labd")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_client_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_status_channel_capacity() -> usize {
    64
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            runtime_dir: default_runtime_dir(),
            output_dir: default_output_dir(),
            log_level: default_log_level(),
            client_timeout: default_client_timeout(),
            status_channel_capacity: default_status_channel_capacity(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a YAML file and `LABD_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("LABD_").split("__"))
            .extract()
    }

    /// Parse configuration from an in-memory YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Yaml::string(yaml)).extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self, drivers: &DriverRegistry) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(LabError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.daemon.status_channel_capacity == 0 {
            return Err(LabError::Configuration(
                "status_channel_capacity must be greater than zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(LabError::Configuration(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }

            let provided = drivers.device_type(&device.driver).ok_or_else(|| {
                LabError::Configuration(format!(
                    "Device '{}' uses unknown driver '{}'",
                    device.name, device.driver
                ))
            })?;
            if provided != device.device_type {
                return Err(LabError::Configuration(format!(
                    "Device '{}' is declared as {} but driver '{}' provides {}",
                    device.name, device.device_type, device.driver, provided
                )));
            }
        }

        Ok(())
    }

    /// Location of the singleton PID marker
    pub fn pid_path(&self) -> PathBuf {
        self.daemon.runtime_dir.join("pid")
    }

    /// Log file used when the daemon runs detached
    pub fn log_path(&self) -> PathBuf {
        self.daemon.runtime_dir.join("labd.log")
    }
}
