//! A mock two-channel oscilloscope that generates synthetic waveforms.
//!
//! Without a bus link the scope is purely in-memory. Attached to a
//! [`MockBusController`] runtime, every setting change is also written to the
//! bus as a SCPI-style message and `initialize` identifies the device with
//! `*IDN?`, so the controller/device/instrument layering can be exercised
//! end to end.

use super::driver::{InstrumentDriver, InstrumentSettings};
use crate::command::{ArgKind, ArgValue, Command, CommandCatalog, CommandSchema};
use crate::controller::{mock::MockBusController, ControllerRuntime, Device};
use crate::error::{DriverError, DriverResult, RuntimeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Number of input channels.
pub const CHANNELS: usize = 2;

/// Samples per acquired trace.
pub const RECORD_LENGTH: usize = 100;

/// Vertical settings of one input channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelSettings {
    /// Whether the channel is acquired.
    pub enabled: bool,
    /// Vertical scale.
    pub volts_per_div: f64,
}

/// Front-panel settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSettings {
    /// Horizontal scale in seconds per division.
    pub timebase_s: f64,
    /// Input channels, channel 1 first.
    pub channels: [ChannelSettings; CHANNELS],
    #[serde(skip)]
    learn: Vec<u8>,
}

impl ScopeSettings {
    fn new(timebase_s: f64, channels: [ChannelSettings; CHANNELS]) -> Self {
        let mut learn = format!("HOR:MAIN:SCA {timebase_s:E}");
        for (i, ch) in channels.iter().enumerate() {
            learn.push_str(&format!(
                ";CH{n}:STATE {state};CH{n}:SCA {vdiv:E}",
                n = i + 1,
                state = u8::from(ch.enabled),
                vdiv = ch.volts_per_div
            ));
        }
        Self {
            timebase_s,
            channels,
            learn: learn.into_bytes(),
        }
    }
}

impl InstrumentSettings for ScopeSettings {
    fn canonical_bytes(&self) -> Option<&[u8]> {
        Some(&self.learn)
    }
}

/// Acquisition state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeStatus {
    /// Whether acquisition is running.
    pub running: bool,
    /// Acquisitions completed so far.
    pub acquisitions: u64,
}

/// One acquired trace.
#[derive(Debug, Clone, Serialize)]
pub struct Waveform {
    /// 1-based input channel.
    pub channel: u8,
    /// Horizontal sample spacing.
    pub seconds_per_sample: f64,
    /// Sampled voltages.
    pub samples: Vec<f64>,
}

/// Traces of all enabled channels from one acquisition.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeReading {
    /// When the acquisition completed.
    pub timestamp: DateTime<Utc>,
    /// One trace per enabled channel.
    pub traces: Vec<Waveform>,
}

struct BusLink {
    controller: Arc<ControllerRuntime<MockBusController>>,
    address: i64,
    timeout: Duration,
}

struct ScopeState {
    timebase_s: f64,
    channels: [ChannelSettings; CHANNELS],
    running: bool,
    acquisitions: u64,
    phase: f64,
    housekeeping_runs: u64,
    init_failure: Option<DriverError>,
    status_failures: VecDeque<DriverError>,
}

impl Default for ScopeState {
    fn default() -> Self {
        Self {
            timebase_s: 1.0e-3,
            channels: [
                ChannelSettings {
                    enabled: true,
                    volts_per_div: 1.0,
                },
                ChannelSettings {
                    enabled: false,
                    volts_per_div: 1.0,
                },
            ],
            running: false,
            acquisitions: 0,
            phase: 0.0,
            housekeeping_runs: 0,
            init_failure: None,
            status_failures: VecDeque::new(),
        }
    }
}

/// Simulated oscilloscope.
pub struct MockScope {
    state: Mutex<ScopeState>,
    latency: Duration,
    bus: Option<BusLink>,
}

impl Default for MockScope {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScope {
    /// Detached scope with default settings.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScopeState::default()),
            latency: Duration::ZERO,
            bus: None,
        }
    }

    /// Scope that mirrors setting changes onto `device`'s bus.
    pub fn attached(
        controller: Arc<ControllerRuntime<MockBusController>>,
        device: &Device,
        timeout: Duration,
    ) -> Self {
        Self {
            bus: Some(BusLink {
                controller,
                address: i64::from(device.address().primary()),
                timeout,
            }),
            ..Self::new()
        }
    }

    /// Delay applied to every command.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `initialize` fail.
    pub fn fail_initialize(&self, error: DriverError) {
        self.state.lock().init_failure = Some(error);
    }

    /// Make the next status poll fail. Calls stack in FIFO order.
    pub fn fail_status(&self, error: DriverError) {
        self.state.lock().status_failures.push_back(error);
    }

    /// How many times housekeeping ran.
    pub fn housekeeping_runs(&self) -> u64 {
        self.state.lock().housekeeping_runs
    }

    fn settings(&self) -> ScopeSettings {
        let state = self.state.lock();
        ScopeSettings::new(state.timebase_s, state.channels)
    }

    async fn bus_write(&self, message: String) -> DriverResult<()> {
        let Some(link) = &self.bus else {
            return Ok(());
        };
        let command = Command::new("write")
            .with_arg("address", link.address)
            .with_arg("data", message);
        self.bus_transfer(link, command).await.map(|_| ())
    }

    async fn bus_transfer(&self, link: &BusLink, command: Command) -> DriverResult<Option<ArgValue>> {
        let done = link
            .controller
            .add_and_process_command_sync(command, link.timeout)
            .await
            .map_err(|err| match err {
                RuntimeError::Timeout(msg) => DriverError::Timeout(msg),
                RuntimeError::Interrupted(msg) => DriverError::Interrupted(msg),
                other => DriverError::Communication(other.to_string()),
            })?;
        match done.failure() {
            Some(failure) => Err(failure.clone()),
            None => Ok(done.result().cloned()),
        }
    }

    fn channel_index(command: &Command) -> DriverResult<usize> {
        let channel = command.arg_i64("channel")?;
        match usize::try_from(channel) {
            Ok(n) if (1..=CHANNELS).contains(&n) => Ok(n - 1),
            _ => Err(DriverError::Unexpected(format!(
                "channel {channel} out of range 1..={CHANNELS}"
            ))),
        }
    }
}

#[async_trait]
impl InstrumentDriver for MockScope {
    type Status = ScopeStatus;
    type Settings = ScopeSettings;
    type Reading = ScopeReading;

    fn instrument_type(&self) -> &str {
        "mockscope"
    }

    fn command_catalog(&self) -> CommandCatalog {
        CommandCatalog::new()
            .with(
                CommandSchema::new("set_timebase")
                    .required("seconds", ArgKind::Float)
                    .describe("Horizontal scale in seconds per division"),
            )
            .with(
                CommandSchema::new("set_channel_enabled")
                    .required("channel", ArgKind::Int)
                    .required("enabled", ArgKind::Bool),
            )
            .with(
                CommandSchema::new("set_volts_per_div")
                    .required("channel", ArgKind::Int)
                    .required("volts", ArgKind::Float),
            )
            .with(
                CommandSchema::new("acquire")
                    .optional("label", ArgKind::Text)
                    .describe("Trigger a single acquisition"),
            )
    }

    async fn initialize(&self) -> DriverResult<()> {
        if let Some(err) = self.state.lock().init_failure.take() {
            return Err(err);
        }
        if let Some(link) = &self.bus {
            let idn = Command::new("query")
                .with_arg("address", link.address)
                .with_arg("data", "*IDN?");
            let reply = self.bus_transfer(link, idn).await?;
            info!(identity = ?reply, "Scope identified");
        }
        self.state.lock().running = true;
        Ok(())
    }

    async fn process_command(&self, command: &Command) -> DriverResult<Option<ArgValue>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        debug!(command = %command, "scope command");

        match command.name() {
            "set_timebase" => {
                let seconds = command.arg_f64("seconds")?;
                if seconds <= 0.0 {
                    return Err(DriverError::Unexpected(format!(
                        "timebase must be positive, got {seconds}"
                    )));
                }
                self.bus_write(format!("HOR:MAIN:SCA {seconds:E}")).await?;
                self.state.lock().timebase_s = seconds;
                Ok(None)
            }
            "set_channel_enabled" => {
                let index = Self::channel_index(command)?;
                let enabled = command.arg_bool("enabled")?;
                self.bus_write(format!(
                    "SEL:CH{} {}",
                    index + 1,
                    if enabled { "ON" } else { "OFF" }
                ))
                .await?;
                self.state.lock().channels[index].enabled = enabled;
                Ok(None)
            }
            "set_volts_per_div" => {
                let index = Self::channel_index(command)?;
                let volts = command.arg_f64("volts")?;
                self.bus_write(format!("CH{}:SCA {volts:E}", index + 1)).await?;
                self.state.lock().channels[index].volts_per_div = volts;
                Ok(None)
            }
            "acquire" => {
                self.bus_write("ACQ:STATE RUN".to_string()).await?;
                let mut state = self.state.lock();
                state.acquisitions += 1;
                Ok(Some(ArgValue::Int(i64::try_from(state.acquisitions).unwrap_or(i64::MAX))))
            }
            other => Err(DriverError::Unsupported(format!("scope command '{other}'"))),
        }
    }

    async fn get_status(&self) -> DriverResult<ScopeStatus> {
        let mut state = self.state.lock();
        if let Some(err) = state.status_failures.pop_front() {
            return Err(err);
        }
        Ok(ScopeStatus {
            running: state.running,
            acquisitions: state.acquisitions,
        })
    }

    async fn get_settings(&self) -> DriverResult<ScopeSettings> {
        Ok(self.settings())
    }

    async fn get_reading(&self) -> DriverResult<ScopeReading> {
        let mut state = self.state.lock();
        if !state.channels.iter().any(|ch| ch.enabled) {
            return Err(DriverError::Unsupported("no channel enabled".into()));
        }

        state.phase += 0.1;
        let phase = state.phase;
        let seconds_per_sample = state.timebase_s * 10.0 / RECORD_LENGTH as f64;
        let traces = state
            .channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.enabled)
            .map(|(i, ch)| Waveform {
                channel: u8::try_from(i + 1).unwrap_or(u8::MAX),
                seconds_per_sample,
                samples: (0..RECORD_LENGTH)
                    .map(|n| {
                        let t = n as f64 / RECORD_LENGTH as f64;
                        // Deterministic ripple instead of random noise
                        let ripple = ((t + phase) * 37.0).sin() * 0.05;
                        ((t * std::f64::consts::TAU + phase).sin() + ripple) / ch.volts_per_div
                    })
                    .collect(),
            })
            .collect();

        Ok(ScopeReading {
            timestamp: Utc::now(),
            traces,
        })
    }

    async fn housekeeping(&self) -> DriverResult<()> {
        self.state.lock().housekeeping_runs += 1;
        Ok(())
    }
}
