//! Pipeline building blocks shared by controller and instrument runtimes.
//!
//! A pipeline is an ingress queue feeding a single worker, optionally followed
//! by an egress queue drained by a dispatcher that notifies listeners:
//!
//! ```text
//! producer --submit--> BoundedQueue --take--> worker --dispatch--> Dispatcher --> listeners
//! ```
//!
//! Periodic pipelines (acquisition collectors, housekeeping) replace the
//! ingress queue with a [`periodic`] ticker using ignore-and-drop overload
//! handling.
//!
//! Every worker step reports a [`StepOutcome`]; the loop around it decides
//! whether to keep going or to stop and report a [`FatalReason`].

pub mod commands;
pub mod dispatcher;
pub mod listeners;
pub mod metrics;
pub mod periodic;
pub mod queue;

pub use commands::CommandPipeline;
pub use dispatcher::Dispatcher;
pub use listeners::{ListenerId, ListenerSet, ListenerSnapshot};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use periodic::spawn_periodic;
pub use queue::BoundedQueue;

use crate::error::{DriverError, DriverResult, ErrorKind, FatalReason};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Result of one worker step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step succeeded; keep going.
    Continue,
    /// Step failed in a tolerated way; the failure was logged, keep going.
    Recovered(DriverError),
    /// The pipeline must stop.
    StopFatal(FatalReason),
}

/// Callback through which a stopping pipeline reports its fatal reason.
pub type FatalHandler = Arc<dyn Fn(FatalReason) + Send + Sync>;

/// Await a driver call, converting a panic into `DriverError::Unexpected`.
pub(crate) async fn guarded<F, T>(call: F) -> DriverResult<T>
where
    F: Future<Output = DriverResult<T>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(DriverError::from_panic(payload)),
    }
}

/// Classify a collection/housekeeping failure against a tolerated set.
///
/// `Interrupted` is always fatal regardless of the tolerated set.
pub(crate) fn classify(pipeline: &str, error: DriverError, tolerated: &[ErrorKind]) -> StepOutcome {
    match error.kind() {
        ErrorKind::Interrupted => StepOutcome::StopFatal(FatalReason::Interrupted(format!(
            "{pipeline}: {}",
            error.message()
        ))),
        kind if tolerated.contains(&kind) => StepOutcome::Recovered(error),
        _ => StepOutcome::StopFatal(FatalReason::Untolerated {
            pipeline: pipeline.to_string(),
            error,
        }),
    }
}
