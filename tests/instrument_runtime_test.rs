//! Instrument runtime pipelines: commands, acquisition modes, suppression,
//! throttling, and egress overflow.

use async_trait::async_trait;
use lab_control::command::{ArgValue, Command};
use lab_control::config::{AcquisitionMode, InstrumentConfig};
use lab_control::error::{DriverError, DriverResult, FatalReason};
use lab_control::instrument::mock::{MockScope, ScopeReading, ScopeSettings, ScopeStatus};
use lab_control::instrument::{
    InstrumentDriver, InstrumentListener, InstrumentRuntime, InstrumentSettings, ValueFeed,
};
use lab_control::service::ServiceState;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[derive(Default)]
struct ScopeRecorder {
    commands: Mutex<Vec<String>>,
    statuses: AtomicUsize,
    settings: AtomicUsize,
    readings: Mutex<Vec<ScopeReading>>,
}

impl InstrumentListener<MockScope> for ScopeRecorder {
    fn on_command_processed(&self, _url: &str, command: &Command) {
        let label = command
            .arg("label")
            .and_then(ArgValue::as_str)
            .unwrap_or(command.name())
            .to_string();
        self.commands.lock().push(label);
    }

    fn on_status_changed(&self, _url: &str, _status: &ScopeStatus) {
        self.statuses.fetch_add(1, Ordering::SeqCst);
    }

    fn on_settings_changed(&self, _url: &str, _settings: &ScopeSettings) {
        self.settings.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reading_arrived(&self, _url: &str, reading: &ScopeReading) {
        self.readings.lock().push(reading.clone());
    }
}

fn acquire(label: &str) -> Command {
    Command::new("acquire").with_arg("label", label)
}

#[tokio::test]
async fn test_paused_instrument_accepts_up_to_capacity() {
    let mut config = InstrumentConfig::none_enabled();
    config.command.enabled = true;
    config.command.queue_capacity = 2;
    config.settings.acquisition.enabled = true;
    config.settings.acquisition.period_ms = 60_000;

    let scope = assert_ok!(InstrumentRuntime::new(MockScope::new(), "mockbus://board0#7", config));
    let recorder = Arc::new(ScopeRecorder::default());
    scope.add_listener(recorder.clone());

    let accepted: Vec<bool> = ["a", "b", "c"]
        .iter()
        .map(|label| scope.add_command(acquire(label)))
        .collect();
    assert_eq!(accepted, vec![true, true, false]);
    assert_eq!(scope.queued_commands(), 2);

    scope.start().await.unwrap();
    wait_for("queued commands", || recorder.commands.lock().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*recorder.commands.lock(), vec!["a", "b"]);
    // Acquisitions leave the settings untouched
    assert!(recorder.settings.load(Ordering::SeqCst) <= 1);
    scope.stop().await;
}

#[tokio::test]
async fn test_identical_settings_notify_once() {
    let mut config = InstrumentConfig::none_enabled();
    config.settings.acquisition.enabled = true;
    config.settings.acquisition.mode = AcquisitionMode::Push;

    let scope = InstrumentRuntime::new(MockScope::new(), "bus#7", config).unwrap();
    let recorder = Arc::new(ScopeRecorder::default());
    scope.add_listener(recorder.clone());
    scope.start().await.unwrap();

    let feed = scope.settings_feed().unwrap();
    let settings = scope.driver().get_settings().await.unwrap();
    for _ in 0..6 {
        feed.push(settings.clone()).unwrap();
    }
    wait_for("first notification", || recorder.settings.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.settings.load(Ordering::SeqCst), 1);

    // Without optimization every value is delivered
    scope.set_optimize_settings_updates(false);
    feed.push(settings.clone()).unwrap();
    feed.push(settings).unwrap();
    wait_for("unoptimized notifications", || recorder.settings.load(Ordering::SeqCst) == 3).await;
    scope.stop().await;
}

#[tokio::test]
async fn test_readings_are_never_suppressed() {
    let mut config = InstrumentConfig::none_enabled();
    config.reading.enabled = true;
    config.reading.period_ms = 10;

    let scope = InstrumentRuntime::new(MockScope::new(), "bus#7", config).unwrap();
    let recorder = Arc::new(ScopeRecorder::default());
    scope.add_listener(recorder.clone());
    scope.start().await.unwrap();

    wait_for("several readings", || recorder.readings.lock().len() >= 3).await;
    scope.stop().await;

    let readings = recorder.readings.lock();
    assert!(readings.iter().all(|r| r.traces.len() == 1));
    assert!(readings.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_housekeeping_runs_until_stop() {
    let mut config = InstrumentConfig::none_enabled();
    config.housekeeping.enabled = true;
    config.housekeeping.period_ms = 10;

    let scope = InstrumentRuntime::new(MockScope::new(), "bus#7", config).unwrap();
    scope.start().await.unwrap();
    wait_for("housekeeping", || scope.driver().housekeeping_runs() >= 3).await;
    scope.stop().await;

    let runs = scope.driver().housekeeping_runs();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scope.driver().housekeeping_runs(), runs);
}

#[tokio::test]
async fn test_tolerated_status_failure_keeps_collecting() {
    let mut config = InstrumentConfig::none_enabled();
    config.status.enabled = true;
    config.status.period_ms = 10;

    let driver = MockScope::new();
    driver.fail_status(DriverError::Timeout("no reply".into()));
    driver.fail_status(DriverError::Timeout("no reply".into()));
    let scope = InstrumentRuntime::new(driver, "bus#7", config).unwrap();
    let recorder = Arc::new(ScopeRecorder::default());
    scope.add_listener(recorder.clone());
    scope.start().await.unwrap();

    wait_for("status after recovery", || recorder.statuses.load(Ordering::SeqCst) == 1).await;
    assert_eq!(scope.state(), ServiceState::Active);
    assert!(scope.current_status().is_some_and(|s| s.running));
    scope.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_egress_overflow_is_fatal() {
    struct Stalling {
        stalled: AtomicBool,
    }

    impl InstrumentListener<MockScope> for Stalling {
        fn on_status_changed(&self, _url: &str, _status: &ScopeStatus) {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(300));
            }
        }
    }

    let mut config = InstrumentConfig::none_enabled();
    config.command.enabled = true;
    config.status.enabled = true;
    config.status.period_ms = 1;
    config.status.queue_capacity = 1;

    let scope = InstrumentRuntime::new(MockScope::new(), "bus#7", config).unwrap();
    scope.add_listener(Arc::new(Stalling {
        stalled: AtomicBool::new(false),
    }));
    scope.start().await.unwrap();

    wait_for("error state", || scope.state() == ServiceState::Error).await;
    assert!(matches!(
        scope.last_error(),
        Some(FatalReason::EgressOverflow { .. })
    ));
    assert!(scope.status_feed().unwrap().is_closed());

    // Sibling pipelines keep running
    let done = assert_ok!(
        scope
            .add_and_process_command_sync(acquire("after overflow"), Duration::from_secs(1))
            .await
    );
    assert_eq!(done.succeeded(), Some(true));

    scope.stop().await;
    assert_eq!(scope.state(), ServiceState::Stopped);
}

// ============================================================================
// Custom drivers
// ============================================================================

#[derive(Debug, PartialEq)]
struct NoSettings;

impl InstrumentSettings for NoSettings {}

/// Driver whose status poll takes longer than the polling period.
#[derive(Default)]
struct SlowStatus {
    active: AtomicUsize,
    max_active: AtomicUsize,
    polls: AtomicU64,
}

#[async_trait]
impl InstrumentDriver for SlowStatus {
    type Status = u64;
    type Settings = NoSettings;
    type Reading = ();

    fn instrument_type(&self) -> &str {
        "slow"
    }

    async fn process_command(&self, _command: &Command) -> DriverResult<Option<ArgValue>> {
        Ok(None)
    }

    async fn get_status(&self) -> DriverResult<u64> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(self.polls.fetch_add(1, Ordering::SeqCst))
    }
}

#[tokio::test]
async fn test_slow_status_poll_never_overlaps() {
    let mut config = InstrumentConfig::none_enabled();
    config.status.enabled = true;
    config.status.period_ms = 5;

    let scope = InstrumentRuntime::new(SlowStatus::default(), "bus#2", config).unwrap();
    scope.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    scope.stop().await;

    assert_eq!(scope.driver().max_active.load(Ordering::SeqCst), 1);
    let (_, collector) = scope
        .metrics()
        .into_iter()
        .find(|(name, _)| name == "slow@bus#2.status")
        .unwrap();
    assert!(collector.skipped > 0);
    assert!(collector.processed >= 3);
}

/// Driver that answers status requests asynchronously through the feed.
#[derive(Default)]
struct Deferred {
    requests: AtomicU64,
}

#[async_trait]
impl InstrumentDriver for Deferred {
    type Status = u64;
    type Settings = NoSettings;
    type Reading = ();

    fn instrument_type(&self) -> &str {
        "deferred"
    }

    async fn process_command(&self, _command: &Command) -> DriverResult<Option<ArgValue>> {
        Ok(None)
    }

    async fn request_status(&self, feed: ValueFeed<u64>) -> DriverResult<()> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3)).await;
            let _ = feed.push(n);
        });
        Ok(())
    }
}

#[derive(Default)]
struct StatusLog(Mutex<Vec<u64>>);

impl InstrumentListener<Deferred> for StatusLog {
    fn on_status_changed(&self, _url: &str, status: &u64) {
        self.0.lock().push(*status);
    }
}

#[tokio::test]
async fn test_request_mode_delivers_through_feed() {
    let mut config = InstrumentConfig::none_enabled();
    config.status.enabled = true;
    config.status.mode = AcquisitionMode::Request;
    config.status.period_ms = 10;

    let scope = InstrumentRuntime::new(Deferred::default(), "bus#4", config).unwrap();
    let log = Arc::new(StatusLog::default());
    scope.add_listener(log.clone());
    scope.start().await.unwrap();

    wait_for("requested statuses", || log.0.lock().len() >= 3).await;
    scope.stop().await;

    let seen = log.0.lock().clone();
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
    assert!(scope.current_status().is_some());
}
