//! Instrument runtime: up to five pipelines per instrument.
//!
//! # Pipelines
//!
//! | Pipeline     | Source                        | Listener callback        | Suppression                     |
//! |--------------|-------------------------------|--------------------------|---------------------------------|
//! | command      | `add_command` / sync variant  | `on_command_processed`   | none                            |
//! | status       | periodic collector or driver  | `on_status_changed`      | equal to held value             |
//! | settings     | collector, driver, commands   | `on_settings_changed`    | equal and `optimize_updates`    |
//! | reading      | periodic collector or driver  | `on_reading_arrived`     | none                            |
//! | housekeeping | periodic                      | (none)                   | n/a                             |
//!
//! Each pipeline is enabled or disabled at construction by
//! [`InstrumentConfig`]. Periods, the settings optimization flag, and the
//! command queue capacity can be changed while running; listeners are told
//! through `on_config_changed`.
//!
//! After every command the runtime refreshes settings (when the settings
//! pipeline is enabled) before dispatching the command result, so observers
//! see the command's effect no later than its completion.
//!
//! # Failure isolation
//!
//! Driver failures inside commands are recorded on the command. Collection
//! failures are ignored when their kind is tolerated by the channel's
//! configuration; otherwise that channel's collector stops and the instrument
//! enters `Error`. Other pipelines keep running until `stop()`.

pub mod channel;
pub mod driver;
pub mod mock;

pub use channel::{ChannelKind, ValueFeed};
pub use driver::{
    settings_equal, ConfigChange, InstrumentDriver, InstrumentListener, InstrumentSettings,
};

use crate::command::{ArgValue, Command, CommandCatalog};
use crate::config::{AcquisitionConfig, AcquisitionMode, InstrumentConfig};
use crate::debug::DebugSink;
use crate::error::{DriverResult, FatalReason, RuntimeError, RuntimeResult};
use crate::pipeline::commands::CommandExecutor;
use crate::pipeline::{
    classify, guarded, spawn_periodic, CommandPipeline, FatalHandler, ListenerId, ListenerSet,
    MetricsSnapshot, PipelineMetrics, StepOutcome,
};
use crate::service::{ServiceState, ServiceStatus, TaskGroup};
use crate::url;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use channel::Channel;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type Listeners<D> = ListenerSet<dyn InstrumentListener<D>>;

// ============================================================================
// Command execution with settings refresh
// ============================================================================

struct InstrumentExecutor<D: InstrumentDriver> {
    driver: Arc<D>,
    settings: Option<Arc<Channel<D::Settings>>>,
    config: Arc<ArcSwap<InstrumentConfig>>,
}

#[async_trait]
impl<D: InstrumentDriver> CommandExecutor for InstrumentExecutor<D> {
    async fn execute(&self, command: &Command) -> DriverResult<Option<ArgValue>> {
        self.driver.process_command(command).await
    }

    async fn after_command(&self, command: &Command) {
        let Some(channel) = &self.settings else {
            return;
        };
        let mode = self.config.load().settings.acquisition.mode;
        let refreshed = match mode {
            AcquisitionMode::Poll => match guarded(self.driver.get_settings()).await {
                // A failed push has already been reported by the feed
                Ok(settings) => channel.feed().push(settings).map_err(|_| ()),
                Err(err) => {
                    debug!(command = %command, "settings refresh failed: {}", err);
                    Err(())
                }
            },
            AcquisitionMode::Request => guarded(self.driver.request_settings(channel.feed()))
                .await
                .map_err(|err| debug!(command = %command, "settings request failed: {}", err)),
            AcquisitionMode::Push => return,
        };
        if refreshed.is_ok() {
            debug!(command = %command, "settings refreshed after command");
        }
    }
}

// ============================================================================
// Channel wiring
// ============================================================================

/// Per-channel glue between driver, configuration, and listeners.
struct Wiring<D: InstrumentDriver, T> {
    select: fn(&InstrumentConfig) -> &AcquisitionConfig,
    suppress: Option<fn(&InstrumentConfig, &T, &T) -> bool>,
    deliver: fn(&dyn InstrumentListener<D>, &str, &T),
    poll: fn(Arc<D>) -> BoxFuture<'static, DriverResult<T>>,
    request: fn(Arc<D>, ValueFeed<T>) -> BoxFuture<'static, DriverResult<()>>,
}

fn status_config(config: &InstrumentConfig) -> &AcquisitionConfig {
    &config.status
}

fn settings_config(config: &InstrumentConfig) -> &AcquisitionConfig {
    &config.settings.acquisition
}

fn reading_config(config: &InstrumentConfig) -> &AcquisitionConfig {
    &config.reading
}

fn same_status<D: InstrumentDriver>(_: &InstrumentConfig, a: &D::Status, b: &D::Status) -> bool {
    a == b
}

fn same_settings<D: InstrumentDriver>(
    config: &InstrumentConfig,
    a: &D::Settings,
    b: &D::Settings,
) -> bool {
    config.settings.optimize_updates && settings_equal(a, b)
}

fn deliver_status<D: InstrumentDriver>(l: &dyn InstrumentListener<D>, url: &str, v: &D::Status) {
    l.on_status_changed(url, v);
}

fn deliver_settings<D: InstrumentDriver>(
    l: &dyn InstrumentListener<D>,
    url: &str,
    v: &D::Settings,
) {
    l.on_settings_changed(url, v);
}

fn deliver_reading<D: InstrumentDriver>(l: &dyn InstrumentListener<D>, url: &str, v: &D::Reading) {
    l.on_reading_arrived(url, v);
}

fn poll_status<D: InstrumentDriver>(driver: Arc<D>) -> BoxFuture<'static, DriverResult<D::Status>> {
    Box::pin(async move { driver.get_status().await })
}

fn poll_settings<D: InstrumentDriver>(
    driver: Arc<D>,
) -> BoxFuture<'static, DriverResult<D::Settings>> {
    Box::pin(async move { driver.get_settings().await })
}

fn poll_reading<D: InstrumentDriver>(
    driver: Arc<D>,
) -> BoxFuture<'static, DriverResult<D::Reading>> {
    Box::pin(async move { driver.get_reading().await })
}

fn request_status<D: InstrumentDriver>(
    driver: Arc<D>,
    feed: ValueFeed<D::Status>,
) -> BoxFuture<'static, DriverResult<()>> {
    Box::pin(async move { driver.request_status(feed).await })
}

fn request_settings<D: InstrumentDriver>(
    driver: Arc<D>,
    feed: ValueFeed<D::Settings>,
) -> BoxFuture<'static, DriverResult<()>> {
    Box::pin(async move { driver.request_settings(feed).await })
}

fn request_reading<D: InstrumentDriver>(
    driver: Arc<D>,
    feed: ValueFeed<D::Reading>,
) -> BoxFuture<'static, DriverResult<()>> {
    Box::pin(async move { driver.request_reading(feed).await })
}

// ============================================================================
// Runtime
// ============================================================================

/// Runtime wrapping one [`InstrumentDriver`].
pub struct InstrumentRuntime<D: InstrumentDriver> {
    url: String,
    driver: Arc<D>,
    catalog: CommandCatalog,
    config: Arc<ArcSwap<InstrumentConfig>>,
    listeners: Arc<Listeners<D>>,
    status: Arc<ServiceStatus>,
    commands: Option<CommandPipeline>,
    status_channel: Option<Arc<Channel<D::Status>>>,
    settings_channel: Option<Arc<Channel<D::Settings>>>,
    reading_channel: Option<Arc<Channel<D::Reading>>>,
    housekeeping: Option<Arc<PipelineMetrics>>,
    tasks: tokio::sync::Mutex<Option<TaskGroup>>,
}

impl<D: InstrumentDriver> InstrumentRuntime<D> {
    /// Build the runtime in `Created` state for the device at `device_url`.
    ///
    /// Queues exist from construction on, so commands may be submitted before
    /// [`start`](Self::start); they are processed once the worker runs.
    pub fn new(driver: D, device_url: &str, config: InstrumentConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let url = url::instrument_url(driver.instrument_type(), device_url);
        let status = Arc::new(ServiceStatus::new(url.clone()));

        let commands = if config.command.enabled {
            Some(CommandPipeline::new(
                url.clone(),
                config.command.queue_capacity,
                config.command.result_queue_capacity,
            )?)
        } else {
            None
        };
        let status_channel =
            Self::channel(ChannelKind::Status, &url, &config.status, &status)?;
        let settings_channel =
            Self::channel(ChannelKind::Settings, &url, &config.settings.acquisition, &status)?;
        let reading_channel =
            Self::channel(ChannelKind::Reading, &url, &config.reading, &status)?;
        let housekeeping = config
            .housekeeping
            .enabled
            .then(|| Arc::new(PipelineMetrics::default()));

        Ok(Self {
            catalog: driver.command_catalog(),
            driver: Arc::new(driver),
            config: Arc::new(ArcSwap::from_pointee(config)),
            listeners: Arc::new(ListenerSet::new()),
            status,
            commands,
            status_channel,
            settings_channel,
            reading_channel,
            housekeeping,
            tasks: tokio::sync::Mutex::new(None),
            url,
        })
    }

    fn channel<T: Send + Sync + 'static>(
        kind: ChannelKind,
        url: &str,
        config: &AcquisitionConfig,
        status: &Arc<ServiceStatus>,
    ) -> RuntimeResult<Option<Arc<Channel<T>>>> {
        if !config.enabled {
            return Ok(None);
        }
        Ok(Some(Arc::new(Channel::new(
            kind,
            url,
            config.queue_capacity,
            status.clone(),
        )?)))
    }

    /// Instrument URL, e.g. `mockscope@mockbus://board0#7`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Commands the driver accepts; build commands against it.
    pub fn command_catalog(&self) -> &CommandCatalog {
        &self.catalog
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<InstrumentConfig> {
        self.config.load_full()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Initialize the driver, then launch every enabled pipeline.
    ///
    /// An initialization failure moves the runtime to `Error` and is returned.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut tasks = self.tasks.lock().await;
        self.status.activate()?;

        info!(instrument = %self.url, "Initializing instrument");
        if let Err(err) = guarded(self.driver.initialize()).await {
            self.status
                .fail("initialize", FatalReason::Initialization(err.clone()));
            return Err(RuntimeError::Initialization(err));
        }

        let mut group = TaskGroup::new();
        self.launch_commands(&mut group);
        if let Some(channel) = &self.status_channel {
            self.launch_channel(
                &mut group,
                channel,
                Wiring {
                    select: status_config,
                    suppress: Some(same_status::<D>),
                    deliver: deliver_status::<D>,
                    poll: poll_status::<D>,
                    request: request_status::<D>,
                },
            );
        }
        if let Some(channel) = &self.settings_channel {
            self.launch_channel(
                &mut group,
                channel,
                Wiring {
                    select: settings_config,
                    suppress: Some(same_settings::<D>),
                    deliver: deliver_settings::<D>,
                    poll: poll_settings::<D>,
                    request: request_settings::<D>,
                },
            );
        }
        if let Some(channel) = &self.reading_channel {
            self.launch_channel(
                &mut group,
                channel,
                Wiring {
                    select: reading_config,
                    suppress: None,
                    deliver: deliver_reading::<D>,
                    poll: poll_reading::<D>,
                    request: request_reading::<D>,
                },
            );
        }
        self.launch_housekeeping(&mut group);

        *tasks = Some(group);
        info!(instrument = %self.url, "Instrument started");
        Ok(())
    }

    /// Cancel every pipeline and wait for the tasks to exit.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(group) = tasks.take() {
            group.shutdown().await;
        }
        if self.status.stop() {
            info!(instrument = %self.url, "Instrument stopped");
        }
    }

    fn fatal_handler(&self, pipeline: &'static str) -> FatalHandler {
        let status = self.status.clone();
        Arc::new(move |reason| status.fail(pipeline, reason))
    }

    fn launch_commands(&self, group: &mut TaskGroup) {
        let Some(commands) = &self.commands else {
            return;
        };
        let cancel = group.token().clone();

        let listeners = self.listeners.clone();
        let url = self.url.clone();
        group.push(commands.spawn_dispatcher(cancel.clone(), move |command| {
            listeners.fan_out("command_processed", |l| l.on_command_processed(&url, &command));
        }));

        let executor = Arc::new(InstrumentExecutor {
            driver: self.driver.clone(),
            settings: self.settings_channel.clone(),
            config: self.config.clone(),
        });
        group.push(commands.spawn_worker(executor, cancel, self.fatal_handler("commands")));
    }

    fn launch_channel<T>(&self, group: &mut TaskGroup, channel: &Arc<Channel<T>>, wiring: Wiring<D, T>)
    where
        T: Send + Sync + 'static,
    {
        let Wiring {
            select,
            suppress,
            deliver,
            poll,
            request,
        } = wiring;
        let kind = channel.kind();
        let root = group.token().clone();
        let feed_token = channel.rearm(&root);

        // Dispatcher keeps draining even if the collector stops
        let suppress = suppress.map(|same| {
            let config = self.config.clone();
            move |held: &T, new: &T| same(&config.load(), held, new)
        });
        let listeners = self.listeners.clone();
        let url = self.url.clone();
        group.push(channel.spawn_dispatcher(root, suppress, move |value: &Arc<T>| {
            listeners.fan_out(kind.name(), |l| deliver(l, &url, value));
        }));

        let mode = select(&self.config.load()).mode;
        if mode == AcquisitionMode::Push {
            debug!(instrument = %self.url, channel = %kind, "push mode, no collector");
            return;
        }

        let period = {
            let config = self.config.clone();
            move || select(&config.load()).period()
        };
        let action = {
            let config = self.config.clone();
            let driver = self.driver.clone();
            let feed = channel.feed();
            move || {
                let driver = driver.clone();
                let feed = feed.clone();
                let tolerated = select(&config.load()).tolerated.clone();
                async move {
                    let result = match mode {
                        AcquisitionMode::Request => guarded(request(driver, feed)).await,
                        _ => match guarded(poll(driver)).await {
                            Ok(value) => {
                                return match feed.push(value) {
                                    Ok(()) => StepOutcome::Continue,
                                    Err(reason) => StepOutcome::StopFatal(reason),
                                }
                            }
                            Err(err) => Err(err),
                        },
                    };
                    match result {
                        Ok(()) => StepOutcome::Continue,
                        Err(err) => classify(kind.name(), err, &tolerated),
                    }
                }
            }
        };
        group.push(channel.spawn_collector(
            feed_token,
            period,
            self.fatal_handler(kind.name()),
            action,
        ));
    }

    fn launch_housekeeping(&self, group: &mut TaskGroup) {
        let Some(metrics) = &self.housekeeping else {
            return;
        };
        let period = {
            let config = self.config.clone();
            move || config.load().housekeeping.period()
        };
        let action = {
            let config = self.config.clone();
            let driver = self.driver.clone();
            move || {
                let driver = driver.clone();
                let tolerated = config.load().housekeeping.tolerated.clone();
                async move {
                    match guarded(driver.housekeeping()).await {
                        Ok(()) => StepOutcome::Continue,
                        Err(err) => classify("housekeeping", err, &tolerated),
                    }
                }
            }
        };
        group.push(spawn_periodic(
            format!("{}.housekeeping", self.url),
            period,
            group.token().child_token(),
            metrics.clone(),
            self.fatal_handler("housekeeping"),
            action,
        ));
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn command_pipeline(&self) -> RuntimeResult<&CommandPipeline> {
        self.commands
            .as_ref()
            .ok_or_else(|| RuntimeError::PipelineDisabled(format!("{}.commands", self.url)))
    }

    /// Best-effort enqueue; returns `false` if the command was dropped, was
    /// already processed, or the command pipeline is disabled.
    pub fn add_command(&self, command: Command) -> bool {
        match &self.commands {
            Some(commands) => commands.submit(command),
            None => {
                warn!(instrument = %self.url, command = %command, "Command pipeline disabled, dropping command");
                false
            }
        }
    }

    /// Enqueue and wait up to `timeout` for the processed command.
    ///
    /// A full queue or an elapsed timeout yields `RuntimeError::Timeout`; a
    /// command removed by [`clear_command_queue`](Self::clear_command_queue)
    /// yields `RuntimeError::Interrupted`. Resubmitting a processed command
    /// yields `RuntimeError::InvalidCommand`.
    pub async fn add_and_process_command_sync(
        &self,
        command: Command,
        timeout: Duration,
    ) -> RuntimeResult<Command> {
        self.command_pipeline()?.submit_sync(command, timeout).await
    }

    /// Remove every queued command; returns the removed commands, each failed
    /// with `Interrupted`.
    pub fn clear_command_queue(&self) -> Vec<Command> {
        self.commands
            .as_ref()
            .map(CommandPipeline::clear)
            .unwrap_or_default()
    }

    /// Commands waiting for the worker.
    pub fn queued_commands(&self) -> usize {
        self.commands.as_ref().map_or(0, CommandPipeline::queued)
    }

    /// Change the command queue capacity. The backlog is kept unless
    /// `discard_backlog` is set or the capacity shrinks.
    pub fn set_command_queue_capacity(
        &self,
        capacity: usize,
        discard_backlog: bool,
    ) -> RuntimeResult<()> {
        let discarded = self.command_pipeline()?.set_capacity(capacity, discard_backlog)?;
        self.update_config(
            ConfigChange::CommandQueueCapacity {
                capacity,
                discarded,
            },
            move |config| config.command.queue_capacity = capacity,
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Runtime configuration
    // ------------------------------------------------------------------------

    /// Change the status polling or request period.
    pub fn set_status_period(&self, period: Duration) -> RuntimeResult<()> {
        let period_ms = period_millis("status", period)?;
        self.update_config(ConfigChange::StatusPeriod { period_ms }, move |config| {
            config.status.period_ms = period_ms;
        });
        Ok(())
    }

    /// Change the settings polling or request period.
    pub fn set_settings_period(&self, period: Duration) -> RuntimeResult<()> {
        let period_ms = period_millis("settings", period)?;
        self.update_config(ConfigChange::SettingsPeriod { period_ms }, move |config| {
            config.settings.acquisition.period_ms = period_ms;
        });
        Ok(())
    }

    /// Change the reading polling or request period.
    pub fn set_reading_period(&self, period: Duration) -> RuntimeResult<()> {
        let period_ms = period_millis("reading", period)?;
        self.update_config(ConfigChange::ReadingPeriod { period_ms }, move |config| {
            config.reading.period_ms = period_ms;
        });
        Ok(())
    }

    /// Change the housekeeping period.
    pub fn set_housekeeping_period(&self, period: Duration) -> RuntimeResult<()> {
        let period_ms = period_millis("housekeeping", period)?;
        self.update_config(ConfigChange::HousekeepingPeriod { period_ms }, move |config| {
            config.housekeeping.period_ms = period_ms;
        });
        Ok(())
    }

    /// Toggle suppression of unchanged settings notifications.
    pub fn set_optimize_settings_updates(&self, enabled: bool) {
        self.update_config(
            ConfigChange::OptimizeSettingsUpdates { enabled },
            move |config| config.settings.optimize_updates = enabled,
        );
    }

    fn update_config<F>(&self, change: ConfigChange, apply: F)
    where
        F: Fn(&mut InstrumentConfig),
    {
        self.config.rcu(|current| {
            let mut next = InstrumentConfig::clone(current);
            apply(&mut next);
            next
        });
        info!(instrument = %self.url, ?change, "Configuration changed");
        let url = &self.url;
        self.listeners
            .fan_out("config_changed", |l| l.on_config_changed(url, &change));
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Register a listener for every instrument event.
    pub fn add_listener(&self, listener: Arc<dyn InstrumentListener<D>>) -> ListenerId {
        self.listeners.register(listener)
    }

    /// Unregister a listener; `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Latest status delivered to listeners.
    pub fn current_status(&self) -> Option<Arc<D::Status>> {
        self.status_channel.as_ref().and_then(|c| c.current())
    }

    /// Latest settings delivered to listeners.
    pub fn current_settings(&self) -> Option<Arc<D::Settings>> {
        self.settings_channel.as_ref().and_then(|c| c.current())
    }

    /// Feed for drivers pushing status values themselves.
    pub fn status_feed(&self) -> RuntimeResult<ValueFeed<D::Status>> {
        feed_of(&self.status_channel, &self.url, ChannelKind::Status)
    }

    /// Feed for drivers pushing settings themselves.
    pub fn settings_feed(&self) -> RuntimeResult<ValueFeed<D::Settings>> {
        feed_of(&self.settings_channel, &self.url, ChannelKind::Settings)
    }

    /// Feed for drivers pushing readings themselves.
    pub fn reading_feed(&self) -> RuntimeResult<ValueFeed<D::Reading>> {
        feed_of(&self.reading_channel, &self.url, ChannelKind::Reading)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.status.state()
    }

    /// Watch lifecycle state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.status.subscribe()
    }

    /// The fatal reason that put the instrument in `Error`, if any.
    pub fn last_error(&self) -> Option<FatalReason> {
        self.status.last_error()
    }

    /// Counters of every enabled pipeline, keyed by pipeline name.
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        let mut metrics = Vec::new();
        if let Some(commands) = &self.commands {
            metrics.extend(commands.metrics());
        }
        if let Some(channel) = &self.status_channel {
            metrics.extend(channel.metrics());
        }
        if let Some(channel) = &self.settings_channel {
            metrics.extend(channel.metrics());
        }
        if let Some(channel) = &self.reading_channel {
            metrics.extend(channel.metrics());
        }
        if let Some(housekeeping) = &self.housekeeping {
            metrics.push((format!("{}.housekeeping", self.url), housekeeping.snapshot()));
        }
        metrics
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

impl<D: InstrumentDriver> Drop for InstrumentRuntime<D> {
    fn drop(&mut self) {
        if let Some(group) = self.tasks.get_mut().as_ref() {
            warn!(instrument = %self.url, "Instrument dropped while running, cancelling tasks");
            group.cancel();
        }
    }
}

fn feed_of<T: Send + Sync + 'static>(
    channel: &Option<Arc<Channel<T>>>,
    url: &str,
    kind: ChannelKind,
) -> RuntimeResult<ValueFeed<T>> {
    channel
        .as_ref()
        .map(Channel::feed)
        .ok_or_else(|| RuntimeError::PipelineDisabled(format!("{url}.{kind}")))
}

fn period_millis(pipeline: &str, period: Duration) -> RuntimeResult<u64> {
    let millis = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Err(RuntimeError::InvalidConfig(format!(
            "{pipeline} period must be at least 1 ms, got {period:?}"
        )));
    }
    Ok(millis)
}

#[cfg(test)]
mod tests {
    use super::mock::{MockScope, ScopeSettings};
    use super::*;
    use crate::error::{DriverError, ErrorKind};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        settings: Mutex<Vec<ScopeSettings>>,
        changes: Mutex<Vec<ConfigChange>>,
    }

    impl InstrumentListener<MockScope> for Recorder {
        fn on_command_processed(&self, _url: &str, command: &Command) {
            self.commands.lock().push(command.name().to_string());
        }

        fn on_settings_changed(&self, _url: &str, settings: &ScopeSettings) {
            self.settings.lock().push(settings.clone());
        }

        fn on_config_changed(&self, _url: &str, change: &ConfigChange) {
            self.changes.lock().push(change.clone());
        }
    }

    fn commands_and_settings() -> InstrumentConfig {
        let mut config = InstrumentConfig::none_enabled();
        config.command.enabled = true;
        config.settings.acquisition.enabled = true;
        config.settings.acquisition.period_ms = 60_000;
        config
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn test_url_composition() {
        let scope =
            InstrumentRuntime::new(MockScope::new(), "gpib://board0#7", InstrumentConfig::none_enabled())
                .unwrap();
        assert_eq!(scope.url(), "mockscope@gpib://board0#7");
    }

    #[tokio::test]
    async fn test_command_refreshes_settings_before_result() {
        let scope = InstrumentRuntime::new(MockScope::new(), "bus#1", commands_and_settings()).unwrap();
        let recorder = Arc::new(Recorder::default());
        scope.add_listener(recorder.clone());
        scope.start().await.unwrap();

        // Initial collection
        eventually("initial settings", || recorder.settings.lock().len() == 1).await;

        let cmd = Command::builder("set_timebase")
            .arg("seconds", 0.5)
            .build(scope.command_catalog())
            .unwrap();
        let done = scope
            .add_and_process_command_sync(cmd, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(done.succeeded(), Some(true));

        eventually("settings notification", || recorder.settings.lock().len() == 2).await;
        assert_eq!(recorder.settings.lock()[1].timebase_s, 0.5);
        assert_eq!(scope.current_settings().unwrap().timebase_s, 0.5);
        scope.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_command_pipeline() {
        let scope =
            InstrumentRuntime::new(MockScope::new(), "bus#1", InstrumentConfig::none_enabled()).unwrap();
        assert!(!scope.add_command(Command::new("acquire")));
        assert!(matches!(
            scope
                .add_and_process_command_sync(Command::new("acquire"), Duration::from_millis(10))
                .await,
            Err(RuntimeError::PipelineDisabled(_))
        ));
        assert!(scope.clear_command_queue().is_empty());
        assert!(scope.status_feed().is_err());
    }

    #[tokio::test]
    async fn test_config_setters_notify_and_validate() {
        let scope = InstrumentRuntime::new(MockScope::new(), "bus#1", commands_and_settings()).unwrap();
        let recorder = Arc::new(Recorder::default());
        scope.add_listener(recorder.clone());

        scope.set_status_period(Duration::from_millis(250)).unwrap();
        scope.set_optimize_settings_updates(false);
        assert!(matches!(
            scope.set_reading_period(Duration::ZERO),
            Err(RuntimeError::InvalidConfig(_))
        ));
        scope.set_command_queue_capacity(4, false).unwrap();

        assert_eq!(scope.config().status.period_ms, 250);
        assert!(!scope.config().settings.optimize_updates);
        assert_eq!(scope.config().command.queue_capacity, 4);
        assert_eq!(
            *recorder.changes.lock(),
            vec![
                ConfigChange::StatusPeriod { period_ms: 250 },
                ConfigChange::OptimizeSettingsUpdates { enabled: false },
                ConfigChange::CommandQueueCapacity {
                    capacity: 4,
                    discarded: 0
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_initialization_failure() {
        let driver = MockScope::new();
        driver.fail_initialize(DriverError::Communication("no device at address".into()));
        let scope = InstrumentRuntime::new(driver, "bus#1", commands_and_settings()).unwrap();

        let err = scope.start().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Initialization(_)));
        assert_eq!(scope.state(), ServiceState::Error);
        assert!(matches!(
            scope.last_error(),
            Some(FatalReason::Initialization(_))
        ));
    }

    #[tokio::test]
    async fn test_untolerated_status_failure_stops_only_status() {
        let mut config = InstrumentConfig::none_enabled();
        config.command.enabled = true;
        config.status.enabled = true;
        config.status.period_ms = 10;
        config.status.tolerated = vec![ErrorKind::Timeout];

        let driver = MockScope::new();
        driver.fail_status(DriverError::Communication("bus error".into()));
        let scope = InstrumentRuntime::new(driver, "bus#1", config).unwrap();
        let recorder = Arc::new(Recorder::default());
        scope.add_listener(recorder.clone());
        scope.start().await.unwrap();

        eventually("error state", || scope.state() == ServiceState::Error).await;

        // Commands still run
        let cmd = scope
            .add_and_process_command_sync(Command::new("acquire"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cmd.succeeded(), Some(true));
        scope.stop().await;
        assert_eq!(scope.state(), ServiceState::Stopped);
    }
}
