//! Configuration system using Figment.
//!
//! Configuration is layered from (lowest to highest precedence):
//! 1. Built-in defaults
//! 2. A TOML file (default: `config/lab_control.toml`)
//! 3. Environment variables prefixed with `LABCTL_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! LABCTL_APPLICATION__LOG_LEVEL=debug
//! LABCTL_INSTRUMENT__COMMAND__QUEUE_CAPACITY=20
//! LABCTL_INSTRUMENT__STATUS__PERIOD_MS=2000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use lab_control::config::LabConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LabConfig::load_from("config/lab_control.toml")?;
//!     println!("Status period: {:?}", config.instrument.status.period());
//!     Ok(())
//! }
//! ```

use crate::error::ErrorKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Defaults for every controller runtime
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Defaults for every instrument runtime
    #[serde(default)]
    pub instrument: InstrumentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Controller runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Capacity of the command ingress queue
    #[serde(default = "default_controller_queue_capacity")]
    pub command_queue_capacity: usize,
    /// Capacity of the result dispatch queue
    #[serde(default = "default_result_queue_capacity")]
    pub result_queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: default_controller_queue_capacity(),
            result_queue_capacity: default_result_queue_capacity(),
        }
    }
}

/// How an acquisition channel obtains fresh values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Periodically call the driver's synchronous getter.
    #[default]
    Poll,
    /// Periodically ask the driver to deliver a value through its feed later.
    Request,
    /// No periodic task; the driver pushes values through its feed.
    Push,
}

/// Instrument runtime configuration, one block per pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Command pipeline
    #[serde(default)]
    pub command: CommandPipelineConfig,
    /// Status acquisition pipeline
    #[serde(default = "default_status_config")]
    pub status: AcquisitionConfig,
    /// Settings acquisition pipeline
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Reading acquisition pipeline
    #[serde(default = "default_reading_config")]
    pub reading: AcquisitionConfig,
    /// Housekeeping pipeline
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            command: CommandPipelineConfig::default(),
            status: default_status_config(),
            settings: SettingsConfig::default(),
            reading: default_reading_config(),
            housekeeping: HousekeepingConfig::default(),
        }
    }
}

impl InstrumentConfig {
    /// Config with every pipeline disabled; enable the ones you need.
    pub fn none_enabled() -> Self {
        let mut config = Self::default();
        config.command.enabled = false;
        config.status.enabled = false;
        config.settings.acquisition.enabled = false;
        config.reading.enabled = false;
        config.housekeeping.enabled = false;
        config
    }
}

/// Command pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPipelineConfig {
    /// Whether the pipeline is launched
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Capacity of the command ingress queue
    #[serde(default = "default_instrument_queue_capacity")]
    pub queue_capacity: usize,
    /// Capacity of the result dispatch queue
    #[serde(default = "default_result_queue_capacity")]
    pub result_queue_capacity: usize,
}

impl Default for CommandPipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: default_instrument_queue_capacity(),
            result_queue_capacity: default_result_queue_capacity(),
        }
    }
}

/// Status/settings/reading acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Whether the pipeline is launched
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Collection mode
    #[serde(default)]
    pub mode: AcquisitionMode,
    /// Collection period in milliseconds
    pub period_ms: u64,
    /// Capacity of the dispatch queue between collector and dispatcher
    #[serde(default = "default_acquisition_queue_capacity")]
    pub queue_capacity: usize,
    /// Failure kinds that are logged and ignored instead of stopping the collector
    pub tolerated: Vec<ErrorKind>,
}

impl AcquisitionConfig {
    /// Enabled, polling config with the given period and tolerated kinds.
    pub fn polling(period_ms: u64, tolerated: Vec<ErrorKind>) -> Self {
        Self {
            enabled: true,
            mode: AcquisitionMode::Poll,
            period_ms,
            queue_capacity: default_acquisition_queue_capacity(),
            tolerated,
        }
    }

    /// Collection period as a `Duration`.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Settings acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Common acquisition options
    #[serde(flatten)]
    pub acquisition: AcquisitionConfig,
    /// Suppress notifications for settings equal to the current value
    #[serde(default = "default_enabled")]
    pub optimize_updates: bool,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionConfig::polling(10_000, vec![ErrorKind::Timeout]),
            optimize_updates: true,
        }
    }
}

/// Housekeeping pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    /// Whether the pipeline is launched
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Invocation period in milliseconds
    #[serde(default = "default_housekeeping_period")]
    pub period_ms: u64,
    /// Failure kinds that are logged and ignored
    #[serde(default = "default_housekeeping_tolerated")]
    pub tolerated: Vec<ErrorKind>,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: default_housekeeping_period(),
            tolerated: default_housekeeping_tolerated(),
        }
    }
}

impl HousekeepingConfig {
    /// Invocation period as a `Duration`.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "lab-control".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_controller_queue_capacity() -> usize {
    32
}

fn default_instrument_queue_capacity() -> usize {
    10
}

fn default_result_queue_capacity() -> usize {
    64
}

fn default_acquisition_queue_capacity() -> usize {
    16
}

fn default_status_config() -> AcquisitionConfig {
    AcquisitionConfig::polling(5_000, vec![ErrorKind::Timeout])
}

fn default_reading_config() -> AcquisitionConfig {
    AcquisitionConfig::polling(10_000, vec![ErrorKind::Timeout, ErrorKind::Unsupported])
}

fn default_housekeeping_period() -> u64 {
    1_000
}

fn default_housekeeping_tolerated() -> Vec<ErrorKind> {
    vec![ErrorKind::Timeout]
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl LabConfig {
    /// Load configuration from `config/lab_control.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/lab_control.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Missing files are not an error; defaults and environment overrides
    /// still apply. After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCTL_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level and format are known
    /// - Every queue capacity is strictly positive
    /// - Every period is strictly positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        positive("controller.command_queue_capacity", self.controller.command_queue_capacity)?;
        positive("controller.result_queue_capacity", self.controller.result_queue_capacity)?;
        self.instrument.validate()
    }
}

impl InstrumentConfig {
    /// Validate capacities and periods of every pipeline block.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("instrument.command.queue_capacity", self.command.queue_capacity)?;
        positive(
            "instrument.command.result_queue_capacity",
            self.command.result_queue_capacity,
        )?;
        for (name, block) in [
            ("status", &self.status),
            ("settings", &self.settings.acquisition),
            ("reading", &self.reading),
        ] {
            positive(&format!("instrument.{name}.queue_capacity"), block.queue_capacity)?;
            positive(&format!("instrument.{name}.period_ms"), block.period_ms as usize)?;
        }
        positive(
            "instrument.housekeeping.period_ms",
            self.housekeeping.period_ms as usize,
        )
    }
}

fn positive(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ValidationError(format!(
            "'{key}' must be strictly positive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = InstrumentConfig::default();
        assert_eq!(config.command.queue_capacity, 10);
        assert_eq!(config.status.period(), Duration::from_secs(5));
        assert_eq!(config.settings.acquisition.period(), Duration::from_secs(10));
        assert_eq!(config.reading.period(), Duration::from_secs(10));
        assert_eq!(config.housekeeping.period(), Duration::from_secs(1));
        assert!(config.settings.optimize_updates);
        assert_eq!(
            config.reading.tolerated,
            vec![ErrorKind::Timeout, ErrorKind::Unsupported]
        );
        assert_eq!(config.status.tolerated, vec![ErrorKind::Timeout]);
    }

    #[test]
    fn test_none_enabled() {
        let config = InstrumentConfig::none_enabled();
        assert!(!config.command.enabled);
        assert!(!config.status.enabled);
        assert!(!config.settings.acquisition.enabled);
        assert!(!config.reading.enabled);
        assert!(!config.housekeeping.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[instrument.command]
queue_capacity = 4

[instrument.status]
period_ms = 250
tolerated = ["timeout", "communication"]

[instrument.settings]
period_ms = 500
tolerated = []
optimize_updates = false
mode = "request"
"#
        )
        .unwrap();

        let config = LabConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.instrument.command.queue_capacity, 4);
        assert_eq!(config.instrument.status.period_ms, 250);
        assert_eq!(
            config.instrument.status.tolerated,
            vec![ErrorKind::Timeout, ErrorKind::Communication]
        );
        assert!(!config.instrument.settings.optimize_updates);
        assert_eq!(
            config.instrument.settings.acquisition.mode,
            AcquisitionMode::Request
        );
        // Untouched blocks keep their defaults
        assert_eq!(config.instrument.reading.period_ms, 10_000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = LabConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, LabConfig::default());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = LabConfig::default();
        config.instrument.command.queue_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut config = LabConfig::default();
        config.instrument.housekeeping.period_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = LabConfig::default();
        config.application.log_level = "chatty".into();
        assert!(config.validate().is_err());
    }
}
