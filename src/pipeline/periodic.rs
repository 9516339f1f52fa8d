//! Periodic invocation with ignore-and-drop overload handling.
//!
//! A ticker fires every `period` (re-read on every cycle, so period changes
//! apply from the next tick on). On each tick one invocation of the action is
//! started unless the previous invocation is still running, in which case the
//! tick is skipped and counted. At most one invocation is therefore in flight
//! per task, and slow invocations never pile up.
//!
//! The first invocation starts immediately. Cancelling the token abandons the
//! invocation in flight; the task exits only after it has been dropped.
//!
//! An invocation returning [`StepOutcome::StopFatal`] cancels the task's token
//! and reports the reason through the fatal handler, exactly once. If the
//! token was already cancelled (shutdown, or a fatal reported elsewhere on the
//! same token) nothing is reported.

use super::metrics::PipelineMetrics;
use super::{FatalHandler, StepOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Spawn a periodic task.
///
/// - `period` is called before every sleep.
/// - `action` builds the future for one invocation.
/// - `on_fatal` is called once if an invocation stops the task.
pub fn spawn_periodic<P, A, Fut>(
    name: impl Into<String>,
    period: P,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    on_fatal: FatalHandler,
    action: A,
) -> JoinHandle<()>
where
    P: Fn() -> Duration + Send + Sync + 'static,
    A: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepOutcome> + Send + 'static,
{
    let name: Arc<str> = Arc::from(name.into());
    tokio::spawn(async move {
        debug!(pipeline = %name, "periodic task started");
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if in_flight.as_ref().is_some_and(|handle| !handle.is_finished()) {
                metrics.record_skipped();
                trace!(pipeline = %name, "previous invocation still running, tick skipped");
            } else {
                in_flight = Some(tokio::spawn(invoke(
                    name.clone(),
                    action(),
                    cancel.clone(),
                    metrics.clone(),
                    on_fatal.clone(),
                )));
            }

            let period = period();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }

        if let Some(handle) = in_flight {
            let _ = handle.await;
        }
        debug!(pipeline = %name, "periodic task stopped");
    })
}

async fn invoke<Fut>(
    name: Arc<str>,
    invocation: Fut,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    on_fatal: FatalHandler,
) where
    Fut: Future<Output = StepOutcome>,
{
    let outcome = tokio::select! {
        biased;
        outcome = invocation => outcome,
        _ = cancel.cancelled() => {
            trace!(pipeline = %name, "invocation abandoned on cancellation");
            return;
        }
    };
    metrics.record_processed();

    match outcome {
        StepOutcome::Continue => {}
        StepOutcome::Recovered(err) => {
            metrics.record_failed();
            warn!(pipeline = %name, kind = %err.kind(), "Tolerated failure: {}", err);
        }
        StepOutcome::StopFatal(reason) => {
            metrics.record_failed();
            if cancel.is_cancelled() {
                debug!(pipeline = %name, "fatal outcome after cancellation ignored: {}", reason);
                return;
            }
            cancel.cancel();
            error!(pipeline = %name, "Pipeline stopped: {}", reason);
            on_fatal(reason);
        }
    }
}
