//! Runtime lifecycle state shared by controllers and instruments.
//!
//! ```text
//! Created ──start──> Active ──fatal──> Error
//!    │                 │                 │
//!    └──────stop───────┴──────stop───────┴──> Stopped ──start──> Active
//! ```
//!
//! A fatal condition in any pipeline moves `Active` (or `Created`, for a
//! failed initialization) to `Error` and records the reason. `Error` is left
//! only through `stop()`.

use crate::error::{FatalReason, RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Constructed; queues accept submissions but no worker runs
    Created,
    /// Pipelines running
    Active,
    /// A pipeline stopped on a fatal condition
    Error,
    /// All pipelines cancelled
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Active => write!(f, "Active"),
            Self::Error => write!(f, "Error"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Observable lifecycle state plus the first fatal reason.
#[derive(Debug)]
pub struct ServiceStatus {
    name: String,
    state: watch::Sender<ServiceState>,
    last_error: Mutex<Option<FatalReason>>,
}

impl ServiceStatus {
    /// New status in `Created`.
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ServiceState::Created);
        Self {
            name: name.into(),
            state,
            last_error: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Receiver notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Reason of the fatal condition that moved the runtime to `Error`.
    pub fn last_error(&self) -> Option<FatalReason> {
        self.last_error.lock().clone()
    }

    /// `Created`/`Stopped` → `Active`; clears the previous fatal reason.
    pub(crate) fn activate(&self) -> RuntimeResult<()> {
        let mut from = ServiceState::Created;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            match *state {
                ServiceState::Created | ServiceState::Stopped => {
                    *state = ServiceState::Active;
                    true
                }
                _ => false,
            }
        });
        if !changed {
            return Err(RuntimeError::InvalidState(format!(
                "'{}' cannot start while {from}",
                self.name
            )));
        }
        *self.last_error.lock() = None;
        info!(service = %self.name, "{} -> Active", from);
        Ok(())
    }

    /// Record a fatal condition reported by `pipeline`.
    ///
    /// The first reason wins; later ones are only logged. Ignored once stopped.
    pub(crate) fn fail(&self, pipeline: &str, reason: FatalReason) {
        let mut from = ServiceState::Created;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            match *state {
                ServiceState::Created | ServiceState::Active => {
                    *state = ServiceState::Error;
                    true
                }
                _ => false,
            }
        });

        if changed {
            error!(
                service = %self.name,
                pipeline,
                "{} -> Error: {}",
                from,
                reason
            );
            *self.last_error.lock() = Some(reason);
        } else if from == ServiceState::Error {
            warn!(service = %self.name, pipeline, "Additional fatal condition: {}", reason);
        } else {
            debug!(service = %self.name, pipeline, "Fatal condition after {}: {}", from, reason);
        }
    }

    /// Any state → `Stopped`. Returns `false` if already stopped.
    pub(crate) fn stop(&self) -> bool {
        let mut from = ServiceState::Stopped;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            if *state == ServiceState::Stopped {
                false
            } else {
                *state = ServiceState::Stopped;
                true
            }
        });
        if changed {
            info!(service = %self.name, "{} -> Stopped", from);
        }
        changed
    }
}

/// Tasks of one `start()`..`stop()` cycle sharing a cancellation token.
#[derive(Debug)]
pub(crate) struct TaskGroup {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel every task and wait for each to exit.
    ///
    /// Tasks stop at their next suspension point; a driver call in progress
    /// is awaited, not preempted.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!("pipeline task ended abnormally: {}", err);
            }
        }
    }
}
