//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below, which match the motorcycle rig this was built for.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::error::{RecorderError, Result};
use crate::serial::DEFAULT_DEVICE_PATHS;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sample loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    #[serde(default = "default_rate_hz")]
    pub rate_hz: u32,

    #[serde(default = "default_status_log_interval_ticks")]
    pub status_log_interval_ticks: u64,
}

/// Engine detection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_off_cooldown_s")]
    pub off_cooldown_s: u64,
}

/// Which probe answers the external-power question
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerSource {
    Sysfs,
    Throttled,
    Always,
}

/// Power monitor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PowerConfig {
    #[serde(default = "default_power_source")]
    pub source: PowerSource,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_battery_status_path")]
    pub battery_status_path: String,

    #[serde(default = "default_battery_voltage_path")]
    pub battery_voltage_path: String,

    #[serde(default = "default_min_external_voltage")]
    pub min_external_voltage: f64,
}

/// Where positioning reports come from
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GpsSource {
    Gpsd,
    Nmea,
}

/// Positioning configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GpsConfig {
    #[serde(default = "default_gps_source")]
    pub source: GpsSource,

    #[serde(default = "default_gpsd_addr")]
    pub gpsd_addr: String,

    #[serde(default = "default_serial_ports")]
    pub serial_ports: Vec<String>,

    #[serde(default = "default_gps_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_initial_fix_wait_s")]
    pub initial_fix_wait_s: u64,

    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

/// Motion sensor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MotionConfig {
    #[serde(default = "default_motion_device_path")]
    pub device_path: String,

    /// Separate IIO device for the magnetometer; empty means `device_path`
    #[serde(default)]
    pub magnetometer_path: String,

    #[serde(default = "default_output_data_rate_hz")]
    pub output_data_rate_hz: u32,
}

/// Persistence configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_file_enabled")]
    pub file_enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

// Default value functions
fn default_rate_hz() -> u32 { 5 }
fn default_status_log_interval_ticks() -> u64 { 300 }

fn default_off_cooldown_s() -> u64 { 30 }

fn default_power_source() -> PowerSource { PowerSource::Sysfs }
fn default_check_interval_ms() -> u64 { 5000 }
fn default_battery_status_path() -> String { "/sys/class/power_supply/BAT/status".to_string() }
fn default_battery_voltage_path() -> String { "/sys/class/power_supply/BAT/voltage_now".to_string() }
fn default_min_external_voltage() -> f64 { 4.0 }

fn default_gps_source() -> GpsSource { GpsSource::Gpsd }
fn default_gpsd_addr() -> String { "127.0.0.1:2947".to_string() }
fn default_serial_ports() -> Vec<String> { DEFAULT_DEVICE_PATHS.iter().map(|p| p.to_string()).collect() }
fn default_gps_baud_rate() -> u32 { 9600 }
fn default_read_timeout_ms() -> u64 { 500 }
fn default_reconnect_interval_ms() -> u64 { 1000 }
fn default_initial_fix_wait_s() -> u64 { 30 }
fn default_history_len() -> usize { 10 }

fn default_motion_device_path() -> String { "/sys/bus/iio/devices/iio:device0".to_string() }
fn default_output_data_rate_hz() -> u32 { 100 }

fn default_db_path() -> String { "/var/lib/ride-recorder/telemetry.db".to_string() }
fn default_busy_timeout_ms() -> u64 { 2000 }

fn default_log_level() -> String { "info".to_string() }
fn default_file_enabled() -> bool { true }
fn default_log_dir() -> String { "/var/log/ride-recorder".to_string() }

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate_hz: default_rate_hz(),
            status_log_interval_ticks: default_status_log_interval_ticks(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { off_cooldown_s: default_off_cooldown_s() }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            source: default_power_source(),
            check_interval_ms: default_check_interval_ms(),
            battery_status_path: default_battery_status_path(),
            battery_voltage_path: default_battery_voltage_path(),
            min_external_voltage: default_min_external_voltage(),
        }
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            source: default_gps_source(),
            gpsd_addr: default_gpsd_addr(),
            serial_ports: default_serial_ports(),
            baud_rate: default_gps_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            initial_fix_wait_s: default_initial_fix_wait_s(),
            history_len: default_history_len(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            device_path: default_motion_device_path(),
            magnetometer_path: String::new(),
            output_data_rate_hz: default_output_data_rate_hz(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_enabled: default_file_enabled(),
            log_dir: default_log_dir(),
        }
    }
}

impl SamplingConfig {
    /// Duration of one sample tick
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz as f64)
    }
}

impl EngineConfig {
    pub fn off_cooldown(&self) -> Duration {
        Duration::from_secs(self.off_cooldown_s)
    }
}

impl PowerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl GpsConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn initial_fix_wait(&self) -> Duration {
        Duration::from_secs(self.initial_fix_wait_s)
    }
}

impl MotionConfig {
    /// Separate magnetometer device, if one is configured
    pub fn magnetometer(&self) -> Option<PathBuf> {
        (!self.magnetometer_path.is_empty()).then(|| PathBuf::from(&self.magnetometer_path))
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn invalid(message: impl Into<String>) -> RecorderError {
    RecorderError::InvalidConfig(message.into())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ride_recorder::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first value out of range
    pub fn validate(&self) -> Result<()> {
        if self.sampling.rate_hz == 0 || self.sampling.rate_hz > 100 {
            return Err(invalid("sampling.rate_hz must be between 1 and 100"));
        }

        if self.sampling.status_log_interval_ticks == 0 {
            return Err(invalid("sampling.status_log_interval_ticks must be greater than 0"));
        }

        if self.engine.off_cooldown_s > 3600 {
            return Err(invalid("engine.off_cooldown_s must be at most 3600"));
        }

        if self.power.check_interval_ms > 60000 {
            return Err(invalid("power.check_interval_ms must be at most 60000"));
        }

        if self.power.source == PowerSource::Sysfs
            && self.power.battery_status_path.is_empty()
            && self.power.battery_voltage_path.is_empty()
        {
            return Err(invalid("power: sysfs source needs battery_status_path or battery_voltage_path"));
        }

        if !(self.power.min_external_voltage > 0.0) {
            return Err(invalid("power.min_external_voltage must be positive"));
        }

        match self.gps.source {
            GpsSource::Gpsd if self.gps.gpsd_addr.is_empty() => {
                return Err(invalid("gps.gpsd_addr cannot be empty when source is gpsd"));
            }
            GpsSource::Nmea if self.gps.serial_ports.iter().all(|p| p.is_empty()) => {
                return Err(invalid("gps.serial_ports cannot be empty when source is nmea"));
            }
            _ => {}
        }

        if ![4800, 9600, 19200, 38400, 57600, 115200].contains(&self.gps.baud_rate) {
            return Err(invalid("gps.baud_rate must be one of: 4800, 9600, 19200, 38400, 57600, 115200"));
        }

        if self.gps.read_timeout_ms == 0 || self.gps.read_timeout_ms > 10000 {
            return Err(invalid("gps.read_timeout_ms must be between 1 and 10000"));
        }

        if self.gps.reconnect_interval_ms == 0 || self.gps.reconnect_interval_ms > 60000 {
            return Err(invalid("gps.reconnect_interval_ms must be between 1 and 60000"));
        }

        if self.gps.initial_fix_wait_s > 600 {
            return Err(invalid("gps.initial_fix_wait_s must be at most 600"));
        }

        if self.gps.history_len == 0 {
            return Err(invalid("gps.history_len must be greater than 0"));
        }

        if self.motion.device_path.is_empty() {
            return Err(invalid("motion.device_path cannot be empty"));
        }

        if self.motion.output_data_rate_hz == 0 {
            return Err(invalid("motion.output_data_rate_hz must be greater than 0"));
        }

        if self.storage.db_path.is_empty() {
            return Err(invalid("storage.db_path cannot be empty"));
        }

        if self.storage.busy_timeout_ms > 60000 {
            return Err(invalid("storage.busy_timeout_ms must be at most 60000"));
        }

        if self.logging.file_enabled && self.logging.log_dir.is_empty() {
            return Err(invalid("logging.log_dir cannot be empty when file logging is enabled"));
        }

        Ok(())
    }
}
