//! Log output for the runtimes and the `lab-control` binary.
//!
//! Runtimes never install a subscriber themselves; they only emit `tracing`
//! events, tagged with the `controller`, `instrument` or `pipeline` field of
//! their origin. Lifecycle transitions log at `info!`, dropped items and
//! recovered driver failures at `warn!`, the transition into `Error` at
//! `error!`, and per-command or per-value flow at `debug!`/`trace!`.
//!
//! The binary installs a `tracing-subscriber` registry from the
//! `[application]` table of [`LabConfig`]: `log_level` sets the default
//! filter (an explicit `RUST_LOG` overrides it) and `log_format` picks
//! `pretty`, `compact` or `json` output.
//!
//! # Example
//! ```no_run
//! use lab_control::{config::LabConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LabConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("runtime starting");
//! # Ok(())
//! # }
//! ```

use crate::config::LabConfig;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Line layout of log records, selected by `application.log_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line records with ANSI colours, for an operator's terminal.
    Pretty,
    /// One record per line without colours, for files and journald.
    Compact,
    /// One JSON object per record.
    Json,
}

/// How the `lab-control` subscriber renders runtime events.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter level when `RUST_LOG` is unset.
    pub level: Level,
    /// Record layout.
    pub format: LogFormat,
    /// Also log span open/close, e.g. around instrument start-up.
    pub with_span_events: bool,
    /// Append the emitting source file and line.
    pub with_file_and_line: bool,
    /// Prefix records with the tokio worker thread name.
    pub with_thread_names: bool,
    /// Colour `Pretty` output; ignored by the other layouts.
    pub with_ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LogConfig {
    /// Read `log_level` and `log_format` from the `[application]` table.
    pub fn from_lab_config(config: &LabConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: parse_format(&config.application.log_format)?,
            ..Default::default()
        })
    }

    /// Defaults with a different filter level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Choose the record layout.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open/close records.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle colours in `Pretty` output.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber described by `config.application`.
pub fn init_from_config(config: &LabConfig) -> Result<(), String> {
    init(LogConfig::from_lab_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber installed earlier (by an embedding application or a test
/// harness) is left in place and `Ok(())` is returned.
pub fn init(config: LogConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer = match config.format {
        LogFormat::Pretty => base
            .pretty()
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => base
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => base.json().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Someone else owns the global dispatcher
            if e.to_string().contains("global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("cannot install log subscriber: {e}"))
            }
        })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "application.log_level '{level}' is not one of trace, debug, info, warn, error"
        )),
    }
}

fn parse_format(format: &str) -> Result<LogFormat, String> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "compact" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!(
            "application.log_format '{format}' is not one of pretty, compact, json"
        )),
    }
}
