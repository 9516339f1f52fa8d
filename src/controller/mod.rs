//! Controller runtime: command execution for one bus controller.
//!
//! A controller (e.g. a GPIB board) owns the bus its devices hang off. The
//! runtime serializes every command through one worker, so drivers never see
//! concurrent bus access, and fans processed commands out to listeners from a
//! separate dispatcher task.
//!
//! # Example
//!
//! ```no_run
//! use lab_control::command::Command;
//! use lab_control::config::ControllerConfig;
//! use lab_control::controller::{mock::MockBusController, ControllerRuntime};
//! use lab_control::url::BusAddress;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = ControllerRuntime::new(MockBusController::new(), "board0", &ControllerConfig::default())?;
//! bus.start().await?;
//!
//! let device = bus.open_device(BusAddress::new(7)?);
//! let reply = bus
//!     .add_and_process_command_sync(
//!         Command::new("query").with_arg("address", 7).with_arg("data", "*IDN?"),
//!         Duration::from_secs(1),
//!     )
//!     .await?;
//! println!("{} answered {:?}", device.url(), reply.result());
//!
//! bus.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod mock;

use crate::command::{ArgValue, Command, CommandCatalog};
use crate::config::ControllerConfig;
use crate::debug::{DebugEvent, DebugSink};
use crate::error::{DriverResult, FatalReason, RuntimeResult};
use crate::pipeline::commands::CommandExecutor;
use crate::pipeline::{CommandPipeline, ListenerId, ListenerSet, MetricsSnapshot};
use crate::service::{ServiceState, ServiceStatus, TaskGroup};
use crate::url::{self, BusAddress};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ============================================================================
// Driver and listener contracts
// ============================================================================

/// Bus-level driver executing raw commands.
#[async_trait]
pub trait ControllerDriver: Send + Sync + 'static {
    /// Scheme of the controller URL, e.g. `"gpib"`.
    fn controller_type(&self) -> &str;

    /// Commands this controller understands; empty accepts anything.
    fn command_catalog(&self) -> CommandCatalog {
        CommandCatalog::new()
    }

    /// Execute one command. Called from a single worker, never concurrently.
    async fn process_command(&self, command: &Command) -> DriverResult<Option<ArgValue>>;
}

/// Observer of a controller runtime.
pub trait ControllerListener: Send + Sync {
    /// A command finished, successfully or not.
    fn on_command_processed(&self, controller_url: &str, command: &Command);

    /// A debug event was emitted on the controller's sink.
    fn on_debug(&self, _controller_url: &str, _event: &DebugEvent) {}
}

/// A device on a controller's bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    controller_url: String,
    address: BusAddress,
    url: String,
}

impl Device {
    /// URL of the controller the device sits on.
    pub fn controller_url(&self) -> &str {
        &self.controller_url
    }

    /// Bus address of the device.
    pub fn address(&self) -> BusAddress {
        self.address
    }

    /// `controllerUrl#address`
    pub fn url(&self) -> &str {
        &self.url
    }
}

struct DriverExecutor<D>(Arc<D>);

#[async_trait]
impl<D: ControllerDriver> CommandExecutor for DriverExecutor<D> {
    async fn execute(&self, command: &Command) -> DriverResult<Option<ArgValue>> {
        self.0.process_command(command).await
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Runtime wrapping one [`ControllerDriver`].
pub struct ControllerRuntime<D: ControllerDriver> {
    url: String,
    driver: Arc<D>,
    catalog: CommandCatalog,
    commands: CommandPipeline,
    listeners: Arc<ListenerSet<dyn ControllerListener>>,
    status: Arc<ServiceStatus>,
    devices: Mutex<BTreeMap<BusAddress, Arc<Device>>>,
    tasks: tokio::sync::Mutex<Option<TaskGroup>>,
}

impl<D: ControllerDriver> ControllerRuntime<D> {
    /// Build the runtime in `Created` state. Commands may be queued before
    /// [`start`](Self::start).
    pub fn new(driver: D, relative_url: &str, config: &ControllerConfig) -> RuntimeResult<Self> {
        let url = url::controller_url(driver.controller_type(), relative_url);
        let commands = CommandPipeline::new(
            url.clone(),
            config.command_queue_capacity,
            config.result_queue_capacity,
        )?;
        let catalog = driver.command_catalog();
        Ok(Self {
            status: Arc::new(ServiceStatus::new(url.clone())),
            url,
            driver: Arc::new(driver),
            catalog,
            commands,
            listeners: Arc::new(ListenerSet::new()),
            devices: Mutex::new(BTreeMap::new()),
            tasks: tokio::sync::Mutex::new(None),
        })
    }

    /// Controller URL, e.g. `mockbus://board0`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Commands the driver accepts.
    pub fn command_catalog(&self) -> &CommandCatalog {
        &self.catalog
    }

    /// Launch the command worker and result dispatcher.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut tasks = self.tasks.lock().await;
        self.status.activate()?;

        let mut group = TaskGroup::new();
        let cancel = group.token().clone();

        let listeners = self.listeners.clone();
        let url = self.url.clone();
        group.push(self.commands.spawn_dispatcher(cancel.clone(), move |command| {
            listeners.fan_out("command_processed", |l| l.on_command_processed(&url, &command));
        }));

        let status = self.status.clone();
        group.push(self.commands.spawn_worker(
            Arc::new(DriverExecutor(self.driver.clone())),
            cancel,
            Arc::new(move |reason| status.fail("commands", reason)),
        ));

        *tasks = Some(group);
        info!(controller = %self.url, "Controller started");
        Ok(())
    }

    /// Cancel all tasks and wait for them to exit. Commands still queued stay
    /// queued for the next start.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(group) = tasks.take() {
            group.shutdown().await;
        }
        if self.status.stop() {
            info!(controller = %self.url, "Controller stopped");
        }
    }

    /// Best-effort enqueue; returns `false` if the command was dropped or was
    /// already processed.
    pub fn add_command(&self, command: Command) -> bool {
        self.commands.submit(command)
    }

    /// Enqueue and wait up to `timeout` for the processed command. Resubmitting
    /// a processed command yields `RuntimeError::InvalidCommand`.
    pub async fn add_and_process_command_sync(
        &self,
        command: Command,
        timeout: Duration,
    ) -> RuntimeResult<Command> {
        self.commands.submit_sync(command, timeout).await
    }

    /// Remove queued commands, failing each with `Interrupted`, and return them.
    pub fn clear_command_queue(&self) -> Vec<Command> {
        self.commands.clear()
    }

    /// Register a listener for processed commands and debug events.
    pub fn add_listener(&self, listener: Arc<dyn ControllerListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    /// Unregister a listener; `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Open the device at `address`, or return the one already open.
    pub fn open_device(&self, address: BusAddress) -> Arc<Device> {
        let mut devices = self.devices.lock();
        devices
            .entry(address)
            .or_insert_with(|| {
                debug!(controller = %self.url, %address, "opening device");
                Arc::new(Device {
                    controller_url: self.url.clone(),
                    address,
                    url: url::device_url(&self.url, address),
                })
            })
            .clone()
    }

    /// Open devices in address order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().values().cloned().collect()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.status.state()
    }

    /// Watch lifecycle state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.status.subscribe()
    }

    /// The fatal reason that put the controller in `Error`, if any.
    pub fn last_error(&self) -> Option<FatalReason> {
        self.status.last_error()
    }

    /// Command queue and result dispatch counters.
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.commands.metrics()
    }

    /// Sink forwarding debug events to every listener's `on_debug`.
    pub fn debug_sink(&self) -> DebugSink {
        let listeners = self.listeners.clone();
        let url = self.url.clone();
        DebugSink::new(move |event| {
            listeners.fan_out("debug", |l| l.on_debug(&url, &event));
        })
    }
}

impl<D: ControllerDriver> Drop for ControllerRuntime<D> {
    fn drop(&mut self) {
        if let Some(group) = self.tasks.get_mut().as_ref() {
            warn!(controller = %self.url, "Controller dropped while running, cancelling tasks");
            group.cancel();
        }
    }
}
