//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dashboard device endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_device_ip")]
    pub ip: String,

    #[serde(default = "default_device_port")]
    pub port: u16,
}

/// Telemetry source and broadcast configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// Name of the simulator-owned shared memory region
    #[serde(default = "default_shared_memory_name")]
    pub shared_memory_name: String,

    /// Simulator process image used for the liveness probe
    #[serde(default = "default_sim_process")]
    pub sim_process: String,

    /// Publish UI telemetry events at 10Hz instead of 1Hz
    #[serde(default)]
    pub high_frequency: bool,
}

/// Device provisioning configuration (serial + flashing)
#[derive(Debug, Deserialize, Clone)]
pub struct ProvisioningConfig {
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,

    #[serde(default = "default_flash_baud")]
    pub flash_baud: u32,

    #[serde(default = "default_chip")]
    pub chip: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Also write logs to a daily-rotated file under `dir`
    #[serde(default)]
    pub file: bool,

    #[serde(default = "default_log_dir")]
    pub dir: String,
}

// Default value functions
fn default_device_ip() -> String { "192.168.1.1".to_string() }
fn default_device_port() -> u16 { 8888 }

fn default_shared_memory_name() -> String { "acpmf_physics".to_string() }
fn default_sim_process() -> String { "acs.exe".to_string() }

fn default_serial_baud() -> u32 { 115_200 }
fn default_flash_baud() -> u32 { 460_800 }
fn default_chip() -> String { "esp32c6".to_string() }

fn default_log_dir() -> String { "./logs".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ip: default_device_ip(),
            port: default_device_port(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            shared_memory_name: default_shared_memory_name(),
            sim_process: default_sim_process(),
            high_frequency: false,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            serial_baud: default_serial_baud(),
            flash_baud: default_flash_baud(),
            chip: default_chip(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: false,
            dir: default_log_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            telemetry: TelemetryConfig::default(),
            provisioning: ProvisioningConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Resolve the configured device address into a socket endpoint
    pub fn endpoint(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.ip.parse().map_err(|_| {
            crate::error::DashBridgeError::Config(toml::de::Error::custom(format!(
                "invalid device ip: {}",
                self.ip
            )))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        self.device.endpoint()?;

        if self.device.port == 0 {
            return Err(crate::error::DashBridgeError::Config(
                toml::de::Error::custom("device port cannot be 0"),
            ));
        }

        if self.telemetry.shared_memory_name.is_empty() {
            return Err(crate::error::DashBridgeError::Config(
                toml::de::Error::custom("telemetry shared_memory_name cannot be empty"),
            ));
        }

        if self.provisioning.serial_baud == 0 || self.provisioning.flash_baud == 0 {
            return Err(crate::error::DashBridgeError::Config(
                toml::de::Error::custom("provisioning baud rates cannot be 0"),
            ));
        }

        if self.logging.file && self.logging.dir.is_empty() {
            return Err(crate::error::DashBridgeError::Config(
                toml::de::Error::custom("logging dir cannot be empty when file logging is enabled"),
            ));
        }

        Ok(())
    }
}
