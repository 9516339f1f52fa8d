//! lab-control command-line interface.
//!
//! `demo` wires a mock oscilloscope onto a mock bus controller and runs every
//! pipeline for a few seconds; `check-config` validates a configuration file.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use lab_control::command::Command;
use lab_control::config::LabConfig;
use lab_control::controller::{mock::MockBusController, ControllerListener, ControllerRuntime};
use lab_control::debug::DebugEvent;
use lab_control::instrument::mock::{MockScope, ScopeReading, ScopeSettings, ScopeStatus};
use lab_control::instrument::{ConfigChange, InstrumentListener, InstrumentRuntime};
use lab_control::logging;
use lab_control::url::BusAddress;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Address of the demo scope on the mock bus.
const SCOPE_ADDRESS: u8 = 7;

#[derive(Parser)]
#[command(name = "lab-control")]
#[command(about = "Run and inspect bus-attached instrument runtimes", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/lab_control.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mock oscilloscope on a mock bus and print pipeline metrics
    Demo {
        /// Number of asynchronous commands to submit
        #[arg(long, default_value = "5")]
        commands: usize,

        /// How long to let the pipelines run
        #[arg(long, default_value = "3")]
        seconds: u64,
    },
    /// Load and validate a configuration file, then print it
    CheckConfig {
        /// Path to a TOML configuration file
        path: PathBuf,
    },
}

/// Logs every event it receives.
struct LoggingListener;

impl ControllerListener for LoggingListener {
    fn on_command_processed(&self, controller_url: &str, command: &Command) {
        info!(controller = controller_url, %command, succeeded = ?command.succeeded(), "bus command processed");
    }
}

impl InstrumentListener<MockScope> for LoggingListener {
    fn on_command_processed(&self, instrument_url: &str, command: &Command) {
        match command.failure() {
            Some(err) => warn!(instrument = instrument_url, %command, error = %err, "command failed"),
            None => info!(instrument = instrument_url, %command, result = ?command.result(), "command processed"),
        }
    }

    fn on_status_changed(&self, instrument_url: &str, status: &ScopeStatus) {
        info!(instrument = instrument_url, ?status, "status changed");
    }

    fn on_settings_changed(&self, instrument_url: &str, settings: &ScopeSettings) {
        info!(
            instrument = instrument_url,
            timebase_s = settings.timebase_s,
            channels = ?settings.channels,
            "settings changed"
        );
    }

    fn on_reading_arrived(&self, instrument_url: &str, reading: &ScopeReading) {
        let peak = reading
            .traces
            .iter()
            .flat_map(|trace| trace.samples.iter().copied())
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));
        info!(instrument = instrument_url, traces = reading.traces.len(), peak, "reading arrived");
    }

    fn on_config_changed(&self, instrument_url: &str, change: &ConfigChange) {
        info!(instrument = instrument_url, ?change, "config changed");
    }

    fn on_debug(&self, instrument_url: &str, event: &DebugEvent) {
        info!(instrument = instrument_url, channel = event.channel, payloads = ?event.payloads, "debug event");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => check_config(path),
        Commands::Demo { commands, seconds } => {
            let config = match &cli.config {
                Some(path) => LabConfig::load_from(path),
                None => LabConfig::load(),
            }
            .context("failed to load configuration")?;
            logging::init_from_config(&config).map_err(|e| anyhow!(e))?;
            demo(config, commands, Duration::from_secs(seconds)).await
        }
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("configuration file {} does not exist", path.display()));
    }
    let config = LabConfig::load_from(&path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn demo(config: LabConfig, commands: usize, duration: Duration) -> Result<()> {
    let listener = Arc::new(LoggingListener);

    let bus = Arc::new(ControllerRuntime::new(
        MockBusController::new().with_latency(Duration::from_millis(2)),
        "board0",
        &config.controller,
    )?);
    bus.driver()
        .set_response(i64::from(SCOPE_ADDRESS), "*IDN?", "MOCK,SCOPE-2CH,0001,1.0");
    bus.add_listener(listener.clone());
    bus.start().await?;

    let device = bus.open_device(BusAddress::new(SCOPE_ADDRESS)?);
    let driver = MockScope::attached(bus.clone(), &device, Duration::from_secs(1));
    let scope = InstrumentRuntime::new(driver, device.url(), config.instrument.clone())?;
    scope.add_listener(listener);
    scope.start().await?;
    info!(instrument = scope.url(), "demo running");

    for n in 0..commands {
        let command = if n % 2 == 0 {
            Command::builder("acquire").arg("label", format!("shot-{n}"))
        } else {
            Command::builder("set_volts_per_div")
                .arg("channel", 1)
                .arg("volts", 0.5 * (n as f64 + 1.0))
        }
        .build(scope.command_catalog())?;
        scope.add_command(command);
    }

    let enable = Command::builder("set_channel_enabled")
        .arg("channel", 2)
        .arg("enabled", true)
        .build(scope.command_catalog())?;
    let done = scope
        .add_and_process_command_sync(enable, Duration::from_secs(2))
        .await?;
    info!(command = %done, succeeded = ?done.succeeded(), "sync command returned");

    scope.debug_sink().emit(DebugEvent::new(0).with_payload("demo"));
    tokio::time::sleep(duration).await;

    scope.stop().await;
    bus.stop().await;

    let mut metrics = bus.metrics();
    metrics.extend(scope.metrics());
    let mut report = serde_json::Map::new();
    for (name, snapshot) in metrics {
        report.insert(name, serde_json::to_value(snapshot)?);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
