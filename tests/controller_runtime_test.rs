//! Controller runtime behaviour under load, failure, and shutdown.

use lab_control::command::Command;
use lab_control::config::ControllerConfig;
use lab_control::controller::{mock::MockBusController, ControllerListener, ControllerRuntime};
use lab_control::error::{DriverError, RuntimeError};
use lab_control::service::ServiceState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};
use tracing_test::traced_test;

#[derive(Default)]
struct Recorder {
    processed: Mutex<Vec<String>>,
}

impl ControllerListener for Recorder {
    fn on_command_processed(&self, _controller_url: &str, command: &Command) {
        let data = command
            .arg("data")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.processed.lock().push(data);
    }
}

struct Panicker;

impl ControllerListener for Panicker {
    fn on_command_processed(&self, _controller_url: &str, _command: &Command) {
        panic!("listener bug");
    }
}

fn write(data: impl Into<String>) -> Command {
    Command::new("write")
        .with_arg("address", 3)
        .with_arg("data", data.into())
}

fn bus(driver: MockBusController, capacity: usize) -> Arc<ControllerRuntime<MockBusController>> {
    let config = ControllerConfig {
        command_queue_capacity: capacity,
        ..Default::default()
    };
    Arc::new(ControllerRuntime::new(driver, "board0", &config).unwrap())
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_notifications_follow_submission_order() {
    let bus = bus(
        MockBusController::new().with_latency(Duration::from_millis(3)),
        32,
    );
    let recorder = Arc::new(Recorder::default());
    bus.add_listener(recorder.clone());
    bus.start().await.unwrap();

    let expected: Vec<String> = (0..20).map(|n| format!("MSG {n}")).collect();
    for data in &expected {
        assert!(bus.add_command(write(data.as_str())));
    }

    wait_for("all notifications", || recorder.processed.lock().len() == expected.len()).await;
    assert_eq!(*recorder.processed.lock(), expected);

    let written: Vec<String> = bus.driver().written().into_iter().map(|(_, d)| d).collect();
    assert_eq!(written, expected);
    bus.stop().await;
}

#[tokio::test]
async fn test_sync_command_times_out_while_executing() {
    let bus = bus(
        MockBusController::new().with_latency(Duration::from_millis(300)),
        8,
    );
    let recorder = Arc::new(Recorder::default());
    bus.add_listener(recorder.clone());
    bus.start().await.unwrap();

    let started = Instant::now();
    let err = assert_err!(
        bus.add_and_process_command_sync(write("SLOW"), Duration::from_millis(50))
            .await
    );
    assert!(matches!(err, RuntimeError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_millis(250));

    // The orphaned command still completes and reaches listeners
    wait_for("orphaned result", || recorder.processed.lock().len() == 1).await;
    bus.stop().await;
}

#[tokio::test]
async fn test_timed_out_queued_command_is_withdrawn() {
    let bus = bus(
        MockBusController::new().with_latency(Duration::from_millis(150)),
        8,
    );
    let recorder = Arc::new(Recorder::default());
    bus.add_listener(recorder.clone());
    bus.start().await.unwrap();

    assert!(bus.add_command(write("FIRST")));
    let err = bus
        .add_and_process_command_sync(write("SECOND"), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout(_)));

    assert!(bus.add_command(write("THIRD")));
    wait_for("remaining commands", || recorder.processed.lock().len() == 2).await;
    assert_eq!(*recorder.processed.lock(), vec!["FIRST", "THIRD"]);
    assert!(bus
        .driver()
        .written()
        .iter()
        .all(|(_, data)| data != "SECOND"));
    bus.stop().await;
}

#[tokio::test]
async fn test_clear_releases_every_waiter() {
    const WAITERS: usize = 5;
    let bus = bus(
        MockBusController::new().with_latency(Duration::from_millis(300)),
        16,
    );
    bus.start().await.unwrap();

    // Occupy the worker
    assert!(bus.add_command(write("BUSY")));

    let mut waiters = Vec::new();
    for n in 0..WAITERS {
        let bus = bus.clone();
        waiters.push(tokio::spawn(async move {
            bus.add_and_process_command_sync(write(format!("WAIT {n}")), Duration::from_secs(10))
                .await
        }));
    }
    wait_for("all waiters queued", || {
        bus.metrics()[0].1.accepted == (WAITERS + 1) as u64
    })
    .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cleared = bus.clear_command_queue();
    assert_eq!(cleared.len(), WAITERS);
    for command in &cleared {
        assert_eq!(command.succeeded(), Some(false));
        assert!(matches!(command.failure(), Some(DriverError::Interrupted(_))));
    }

    let released = tokio::time::timeout(Duration::from_secs(1), futures::future::join_all(waiters))
        .await
        .unwrap();
    for result in released {
        assert!(matches!(result.unwrap(), Err(RuntimeError::Interrupted(_))));
    }
    bus.stop().await;

    // Cleared commands never reach the bus
    assert!(bus
        .driver()
        .written()
        .iter()
        .all(|(_, data)| !data.starts_with("WAIT")));
}

#[tokio::test]
async fn test_resubmitted_command_is_rejected() {
    let bus = bus(MockBusController::new(), 8);
    let recorder = Arc::new(Recorder::default());
    bus.add_listener(recorder.clone());
    bus.start().await.unwrap();

    let done = assert_ok!(
        bus.add_and_process_command_sync(write("ONCE"), Duration::from_secs(1))
            .await
    );
    assert_eq!(done.succeeded(), Some(true));

    assert!(!bus.add_command(done.clone()));
    let err = assert_err!(
        bus.add_and_process_command_sync(done, Duration::from_secs(1))
            .await
    );
    assert!(matches!(err, RuntimeError::InvalidCommand(_)));

    // The worker survives and keeps serving fresh commands
    let fresh = assert_ok!(
        bus.add_and_process_command_sync(write("AGAIN"), Duration::from_secs(1))
            .await
    );
    assert_eq!(fresh.succeeded(), Some(true));
    assert_eq!(bus.state(), ServiceState::Active);
    assert!(bus.last_error().is_none());
    wait_for("both notifications", || recorder.processed.lock().len() == 2).await;
    assert_eq!(*recorder.processed.lock(), vec!["ONCE", "AGAIN"]);
    bus.stop().await;
}

#[tokio::test]
async fn test_driver_failure_is_recorded_not_fatal() {
    let bus = bus(MockBusController::new(), 8);
    bus.driver()
        .fail_next(DriverError::Communication("no listener on bus".into()));
    bus.start().await.unwrap();

    let failed = assert_ok!(
        bus.add_and_process_command_sync(write("A"), Duration::from_secs(1))
            .await
    );
    assert_eq!(failed.succeeded(), Some(false));
    assert!(matches!(failed.failure(), Some(DriverError::Communication(_))));

    let ok = bus
        .add_and_process_command_sync(write("B"), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(ok.succeeded(), Some(true));
    assert_eq!(bus.state(), ServiceState::Active);
    bus.stop().await;
}

#[tokio::test]
#[traced_test]
async fn test_overfilled_queue_drops_with_warning() {
    const CAPACITY: usize = 3;
    let bus = bus(MockBusController::new(), CAPACITY);
    let recorder = Arc::new(Recorder::default());
    bus.add_listener(recorder.clone());

    let accepted = (0..CAPACITY + 5)
        .filter(|n| bus.add_command(write(format!("CMD {n}"))))
        .count();
    assert_eq!(accepted, CAPACITY);
    logs_assert(|lines: &[&str]| {
        let drops = lines
            .iter()
            .filter(|line| line.contains("full, dropping item"))
            .count();
        if drops == 5 {
            Ok(())
        } else {
            Err(format!("expected 5 drop warnings, found {drops}"))
        }
    });

    bus.start().await.unwrap();
    wait_for("queued commands", || recorder.processed.lock().len() == CAPACITY).await;
    assert_eq!(*recorder.processed.lock(), vec!["CMD 0", "CMD 1", "CMD 2"]);

    let snapshot = bus.metrics()[0].1;
    assert_eq!(snapshot.accepted, CAPACITY as u64);
    assert_eq!(snapshot.dropped, 5);
    bus.stop().await;
}

#[tokio::test]
async fn test_panicking_listener_is_isolated() {
    let bus = bus(MockBusController::new(), 8);
    let recorder = Arc::new(Recorder::default());
    bus.add_listener(Arc::new(Panicker));
    bus.add_listener(recorder.clone());
    bus.start().await.unwrap();

    bus.add_command(write("ONE"));
    bus.add_command(write("TWO"));
    wait_for("both notifications", || recorder.processed.lock().len() == 2).await;
    assert_eq!(bus.state(), ServiceState::Active);
    bus.stop().await;
}

#[tokio::test]
async fn test_backlog_survives_restart() {
    let bus = bus(
        MockBusController::new().with_latency(Duration::from_millis(50)),
        8,
    );
    let recorder = Arc::new(Recorder::default());
    bus.add_listener(recorder.clone());
    bus.start().await.unwrap();
    bus.stop().await;
    assert_eq!(bus.state(), ServiceState::Stopped);

    bus.add_command(write("LATE"));
    bus.start().await.unwrap();
    wait_for("backlog processed", || recorder.processed.lock().len() == 1).await;
    bus.stop().await;

    // Stopping twice is harmless
    bus.stop().await;
    assert_eq!(bus.state(), ServiceState::Stopped);
}
