//! # Fleet Configuration
//!
//! One TOML file describes the transport defaults, scheduler tuning, safety
//! limits, material presets and the devices to register at startup.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [transport]
//! baud = 115200
//! settle_ms = 2000
//!
//! [scheduler]
//! poll_interval_ms = 500
//! payload_root = "/var/lib/fleet/jobs"
//!
//! [safety]
//! max_hotend_temp = 260.0
//!
//! [[devices]]
//! id = "printer-1"
//! name = "Workshop Prusa"
//! address = "/dev/ttyUSB0"
//! ```
//!
//! Every section is optional; missing values fall back to the `default_*`
//! functions at the bottom of this file.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the fleet host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default = "default_materials")]
    pub materials: Vec<MaterialProfile>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            scheduler: SchedulerConfig::default(),
            safety: SafetyConfig::default(),
            materials: default_materials(),
            devices: Vec::new(),
        }
    }
}

/// Serial line settings shared by every device unless overridden.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Delay after opening a port before it is used. Opening the port
    /// resets most Arduino-based boards.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            settle_ms: default_settle_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl TransportConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Dispatch loop tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Upper bound on how long the loop sleeps without a wake-up.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How many finished job outcomes are kept for `job_state` queries.
    #[serde(default = "default_outcome_history")]
    pub outcome_history: usize,
    #[serde(default = "default_stream_payloads")]
    pub stream_payloads: bool,
    /// Relative payload references resolve against this directory.
    #[serde(default)]
    pub payload_root: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            outcome_history: default_outcome_history(),
            stream_payloads: default_stream_payloads(),
            payload_root: None,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Temperature limits and shutdown timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyConfig {
    #[serde(default = "default_max_hotend_temp")]
    pub max_hotend_temp: f64,
    #[serde(default = "default_max_bed_temp")]
    pub max_bed_temp: f64,
    #[serde(default = "default_cooldown_grace_ms")]
    pub cooldown_grace_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_hotend_temp: default_max_hotend_temp(),
            max_bed_temp: default_max_bed_temp(),
            cooldown_grace_ms: default_cooldown_grace_ms(),
        }
    }
}

impl SafetyConfig {
    pub fn cooldown_grace(&self) -> Duration {
        Duration::from_millis(self.cooldown_grace_ms)
    }
}

/// Named hotend/bed temperature preset.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MaterialProfile {
    pub name: String,
    pub hotend: f64,
    pub bed: f64,
}

impl MaterialProfile {
    pub fn new(name: &str, hotend: f64, bed: f64) -> Self {
        Self {
            name: name.to_string(),
            hotend,
            bed,
        }
    }
}

/// A device to register at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    #[serde(default)]
    pub baud: Option<u32>,
}

impl Config {
    /// Validate value ranges and device uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.baud == 0 {
            return Err(ConfigError::Invalid("transport.baud must be > 0".to_string()));
        }
        if self.transport.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.response_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.scheduler.outcome_history == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.outcome_history must be > 0".to_string(),
            ));
        }
        if self.safety.max_hotend_temp <= 0.0 || self.safety.max_bed_temp <= 0.0 {
            return Err(ConfigError::Invalid(
                "safety temperature limits must be > 0".to_string(),
            ));
        }

        let mut materials = HashSet::new();
        for material in &self.materials {
            if !materials.insert(material.name.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate material profile '{}'",
                    material.name
                )));
            }
            if material.hotend > self.safety.max_hotend_temp || material.bed > self.safety.max_bed_temp {
                return Err(ConfigError::Invalid(format!(
                    "Material '{}' exceeds the safety limits",
                    material.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ConfigError::Invalid("Device id cannot be empty".to_string()));
            }
            if device.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Device '{}' has no address",
                    device.id
                )));
            }
            if device.baud == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "Device '{}' baud must be > 0",
                    device.id
                )));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate device id '{}'",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

/// Look up a material profile by name, ignoring case.
pub fn find_material<'a>(profiles: &'a [MaterialProfile], name: &str) -> Option<&'a MaterialProfile> {
    profiles.iter().find(|m| m.name.eq_ignore_ascii_case(name))
}

// Default value functions
fn default_baud() -> u32 { 115200 }
fn default_settle_ms() -> u64 { 2000 }
fn default_response_timeout_ms() -> u64 { 5000 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_outcome_history() -> usize { 256 }
fn default_stream_payloads() -> bool { true }
fn default_max_hotend_temp() -> f64 { 260.0 }
fn default_max_bed_temp() -> f64 { 120.0 }
fn default_cooldown_grace_ms() -> u64 { 1000 }
fn default_materials() -> Vec<MaterialProfile> {
    vec![
        MaterialProfile::new("PLA", 200.0, 60.0),
        MaterialProfile::new("PETG", 240.0, 80.0),
        MaterialProfile::new("ABS", 250.0, 100.0),
    ]
}

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
