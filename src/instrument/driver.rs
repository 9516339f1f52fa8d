//! Instrument driver and listener contracts.

use super::channel::ValueFeed;
use crate::command::{ArgValue, Command, CommandCatalog};
use crate::debug::DebugEvent;
use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Settings value of an instrument.
///
/// Instruments that can dump their complete configuration as a byte string
/// (e.g. a SCPI `*LRN?` reply) return it from `canonical_bytes`; two settings
/// values that both expose bytes are compared on those bytes only.
pub trait InstrumentSettings: PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Complete configuration dump, if the instrument has one.
    fn canonical_bytes(&self) -> Option<&[u8]> {
        None
    }
}

/// Settings equality: canonical bytes when both sides have them, `PartialEq`
/// otherwise.
pub fn settings_equal<S: InstrumentSettings>(a: &S, b: &S) -> bool {
    match (a.canonical_bytes(), b.canonical_bytes()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Driver for one instrument.
///
/// Every capability except `process_command` is optional; the defaults report
/// `Unsupported` (or succeed, for `initialize` and `housekeeping`).
///
/// `get_*` methods are used in [`Poll`](crate::config::AcquisitionMode::Poll)
/// mode and return the value directly. `request_*` methods are used in
/// [`Request`](crate::config::AcquisitionMode::Request) mode: the driver starts
/// the acquisition and delivers the value later through the feed.
#[async_trait]
pub trait InstrumentDriver: Send + Sync + 'static {
    /// Status snapshot; equal consecutive values are not re-delivered.
    type Status: PartialEq + fmt::Debug + Send + Sync + 'static;
    /// Settings snapshot.
    type Settings: InstrumentSettings;
    /// One measurement.
    type Reading: fmt::Debug + Send + Sync + 'static;

    /// Prefix of the instrument URL, e.g. `"tds3000"`.
    fn instrument_type(&self) -> &str;

    /// Commands the driver accepts; the default accepts anything.
    fn command_catalog(&self) -> CommandCatalog {
        CommandCatalog::new()
    }

    /// Called by `start()` before any pipeline runs.
    async fn initialize(&self) -> DriverResult<()> {
        Ok(())
    }

    /// Execute one command. Called from a single worker, never concurrently
    /// with another command.
    async fn process_command(&self, command: &Command) -> DriverResult<Option<ArgValue>>;

    async fn get_status(&self) -> DriverResult<Self::Status> {
        Err(unsupported("status polling"))
    }

    async fn request_status(&self, _feed: ValueFeed<Self::Status>) -> DriverResult<()> {
        Err(unsupported("status requests"))
    }

    async fn get_settings(&self) -> DriverResult<Self::Settings> {
        Err(unsupported("settings polling"))
    }

    async fn request_settings(&self, _feed: ValueFeed<Self::Settings>) -> DriverResult<()> {
        Err(unsupported("settings requests"))
    }

    async fn get_reading(&self) -> DriverResult<Self::Reading> {
        Err(unsupported("reading polling"))
    }

    async fn request_reading(&self, _feed: ValueFeed<Self::Reading>) -> DriverResult<()> {
        Err(unsupported("reading requests"))
    }

    /// Periodic maintenance (keep-alive, error queue polling, ...).
    async fn housekeeping(&self) -> DriverResult<()> {
        Ok(())
    }
}

fn unsupported(what: &str) -> DriverError {
    DriverError::Unsupported(format!("driver does not implement {what}"))
}

/// Runtime configuration change reported to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "setting", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ConfigChange {
    StatusPeriod { period_ms: u64 },
    SettingsPeriod { period_ms: u64 },
    ReadingPeriod { period_ms: u64 },
    HousekeepingPeriod { period_ms: u64 },
    OptimizeSettingsUpdates { enabled: bool },
    /// `discarded` counts the queued commands removed by the change.
    CommandQueueCapacity { capacity: usize, discarded: usize },
}

/// Observer of an instrument runtime. Implement only what you need.
///
/// Callbacks run on dispatcher tasks; a slow callback delays later events of
/// the same pipeline only. A panicking callback is logged and skipped.
pub trait InstrumentListener<D: InstrumentDriver>: Send + Sync {
    /// A command finished, successfully or not.
    fn on_command_processed(&self, _instrument_url: &str, _command: &Command) {}

    /// A status different from the previous one arrived.
    fn on_status_changed(&self, _instrument_url: &str, _status: &D::Status) {}

    /// New settings arrived; unchanged ones are skipped when optimization is on.
    fn on_settings_changed(&self, _instrument_url: &str, _settings: &D::Settings) {}

    /// A reading arrived.
    fn on_reading_arrived(&self, _instrument_url: &str, _reading: &D::Reading) {}

    /// A runtime configuration setter was applied.
    fn on_config_changed(&self, _instrument_url: &str, _change: &ConfigChange) {}

    /// A debug event was emitted on the instrument's sink.
    fn on_debug(&self, _instrument_url: &str, _event: &DebugEvent) {}
}
