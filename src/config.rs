//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{EngineError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device discovery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Scan auto-stops after this many seconds
    #[serde(default = "default_scan_timeout_s")]
    pub timeout_s: u64,

    /// RSSI above which a named device scores as a strong candidate
    #[serde(default = "default_strong_rssi_dbm")]
    pub strong_rssi_dbm: i16,

    /// Case-insensitive tokens matched against name and id
    #[serde(default = "default_match_tokens")]
    pub match_tokens: Vec<String>,
}

/// Radio link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Budget for each authentication strategy
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Used when the custom settings carry no key
    #[serde(default)]
    pub default_auth_key: String,
}

/// Frame decoder configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DecoderConfig {
    /// Fill trip and economy fields with labelled placeholders
    #[serde(default = "default_placeholder_trip_fields")]
    pub placeholder_trip_fields: bool,

    /// Seed for the placeholder generator (random when absent)
    #[serde(default)]
    pub placeholder_seed: Option<u64>,
}

/// Fallback synthesizer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub cached_enabled: bool,

    #[serde(default = "default_true")]
    pub sensor_enabled: bool,

    #[serde(default = "default_true")]
    pub synthetic_enabled: bool,

    /// Emit period while the fallback is authoritative
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_sensor_poll_interval_ms")]
    pub sensor_poll_interval_ms: u64,

    /// Motion is flagged when |a| exceeds 1 g plus this margin
    #[serde(default = "default_motion_threshold_g")]
    pub motion_threshold_g: f64,

    /// Sensor speed estimates older than this are ignored
    #[serde(default = "default_sensor_max_age_s")]
    pub sensor_max_age_s: u64,

    /// Start emitting fallback records from `initialize()`
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Write synthetic records to the cache as the next baseline
    #[serde(default)]
    pub persist_estimates: bool,
}

/// Synthetic generator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyntheticConfig {
    #[serde(default)]
    pub seed: Option<u64>,

    /// Gear shifts only happen above this speed
    #[serde(default = "default_min_shift_speed_kmh")]
    pub min_shift_speed_kmh: u16,

    /// Chance per tick of a ±1 gear shift
    #[serde(default = "default_shift_probability")]
    pub shift_probability: f64,
}

/// Durable storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Daily rolling log files go here when set
    #[serde(default)]
    pub file_dir: Option<String>,
}

// Default value functions
fn default_true() -> bool { true }

fn default_scan_timeout_s() -> u64 { 30 }
fn default_strong_rssi_dbm() -> i16 { -70 }
fn default_match_tokens() -> Vec<String> {
    ["moto", "bike", "tft", "dash", "ride"].iter().map(|s| s.to_string()).collect()
}

fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_auth_timeout_ms() -> u64 { 5_000 }

fn default_placeholder_trip_fields() -> bool { true }

fn default_tick_interval_ms() -> u64 { 1000 }
fn default_sensor_poll_interval_ms() -> u64 { 1000 }
fn default_motion_threshold_g() -> f64 { 0.15 }
fn default_sensor_max_age_s() -> u64 { 5 }

fn default_min_shift_speed_kmh() -> u16 { 15 }
fn default_shift_probability() -> f64 { 0.05 }

fn default_storage_dir() -> String { "./data".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_scan_timeout_s(),
            strong_rssi_dbm: default_strong_rssi_dbm(),
            match_tokens: default_match_tokens(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            default_auth_key: String::new(),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            placeholder_trip_fields: default_placeholder_trip_fields(),
            placeholder_seed: None,
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cached_enabled: true,
            sensor_enabled: true,
            synthetic_enabled: true,
            tick_interval_ms: default_tick_interval_ms(),
            sensor_poll_interval_ms: default_sensor_poll_interval_ms(),
            motion_threshold_g: default_motion_threshold_g(),
            sensor_max_age_s: default_sensor_max_age_s(),
            auto_start: true,
            persist_estimates: false,
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed: None,
            min_shift_speed_kmh: default_min_shift_speed_kmh(),
            shift_probability: default_shift_probability(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: default_storage_dir() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_dir: None,
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> EngineError {
    EngineError::Config(toml::de::Error::custom(message))
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
    /// use ride_telemetry::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.scan.timeout_s == 0 || self.scan.timeout_s > 300 {
            return Err(invalid("scan timeout_s must be between 1 and 300"));
        }

        if self.scan.strong_rssi_dbm > 0 || self.scan.strong_rssi_dbm < -127 {
            return Err(invalid("strong_rssi_dbm must be between -127 and 0"));
        }

        if self.scan.match_tokens.iter().any(|t| t.trim().is_empty()) {
            return Err(invalid("match_tokens cannot contain empty tokens"));
        }

        if self.link.connect_timeout_ms == 0 || self.link.connect_timeout_ms > 60_000 {
            return Err(invalid("connect_timeout_ms must be between 1 and 60000"));
        }

        if self.link.auth_timeout_ms == 0 || self.link.auth_timeout_ms > 60_000 {
            return Err(invalid("auth_timeout_ms must be between 1 and 60000"));
        }

        if self.fallback.tick_interval_ms < 100 || self.fallback.tick_interval_ms > 60_000 {
            return Err(invalid("tick_interval_ms must be between 100 and 60000"));
        }

        if self.fallback.sensor_poll_interval_ms < 100 || self.fallback.sensor_poll_interval_ms > 60_000 {
            return Err(invalid("sensor_poll_interval_ms must be between 100 and 60000"));
        }

        if !(0.0..=2.0).contains(&self.fallback.motion_threshold_g) {
            return Err(invalid("motion_threshold_g must be between 0.0 and 2.0"));
        }

        if self.fallback.sensor_max_age_s == 0 {
            return Err(invalid("sensor_max_age_s must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.synthetic.shift_probability) {
            return Err(invalid("shift_probability must be between 0.0 and 1.0"));
        }

        if self.synthetic.min_shift_speed_kmh > 300 {
            return Err(invalid("min_shift_speed_kmh must be at most 300"));
        }

        if self.storage.dir.is_empty() {
            return Err(invalid("storage dir cannot be empty"));
        }

        if let Some(dir) = &self.logging.file_dir {
            if dir.is_empty() {
                return Err(invalid("logging file_dir cannot be empty when set"));
            }
        }

        Ok(())
    }
}
