//! Command submission and execution, shared by controllers and instruments.
//!
//! # Flow
//!
//! ```text
//! add_command ─┐
//!              ├─> ingress queue ─> worker ─> executor.execute ─> after_command ─> result dispatcher
//! submit_sync ─┘                       │
//!                                      └─> completion channel (sync callers)
//! ```
//!
//! Driver failures are captured into the command's outcome; the worker keeps
//! going. The worker stops and reports a fatal reason on an `Interrupted`
//! driver failure (after the command has been recorded and dispatched), on an
//! overflow of the result dispatch queue, and on a panic outside the driver
//! call.
//!
//! A command is processed at most once. Submitting one that already carries
//! an outcome is rejected.

use super::dispatcher::Dispatcher;
use super::metrics::{MetricsSnapshot, PipelineMetrics};
use super::queue::BoundedQueue;
use super::{guarded, FatalHandler, StepOutcome};
use crate::command::{ArgValue, Command};
use crate::error::{DriverError, DriverResult, FatalReason, RuntimeError, RuntimeResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Completion channel for a synchronous submission.
type Completion = oneshot::Sender<RuntimeResult<Command>>;

/// A queued command and, for synchronous submissions, its waiter.
#[derive(Debug)]
pub(crate) struct PendingCommand {
    ticket: u64,
    command: Command,
    completion: Option<Completion>,
}

impl PendingCommand {
    /// Record an `Interrupted` failure, release the waiter if any, and hand
    /// back the failed command.
    fn interrupt(self, reason: &str) -> Command {
        let Self {
            mut command,
            completion,
            ..
        } = self;
        command.fail(DriverError::Interrupted(reason.to_string()));
        if let Some(tx) = completion {
            let _ = tx.send(Err(RuntimeError::Interrupted(format!(
                "command '{}' {reason}",
                command.name()
            ))));
        }
        command
    }
}

/// What the worker runs for each command.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// Execute one command against the driver.
    async fn execute(&self, command: &Command) -> DriverResult<Option<ArgValue>>;

    /// Runs after every attempt, before the result is dispatched.
    async fn after_command(&self, _command: &Command) {}
}

/// Ingress queue, worker, and result dispatcher for commands.
#[derive(Debug)]
pub struct CommandPipeline {
    name: String,
    queue: Arc<BoundedQueue<PendingCommand>>,
    results: Dispatcher<Arc<Command>>,
    next_ticket: AtomicU64,
}

impl CommandPipeline {
    /// Create the queues. Both capacities must be strictly positive.
    pub fn new(
        name: impl Into<String>,
        queue_capacity: usize,
        result_capacity: usize,
    ) -> RuntimeResult<Self> {
        let name = name.into();
        let queue = BoundedQueue::new(
            format!("{name}.commands"),
            queue_capacity,
            Arc::new(PipelineMetrics::default()),
        )?;
        let results = Dispatcher::new(format!("{name}.results"), result_capacity)?;
        Ok(Self {
            name,
            queue: Arc::new(queue),
            results,
            next_ticket: AtomicU64::new(0),
        })
    }

    /// Current ingress capacity.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Commands waiting for the worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Ingress and result-dispatch counters, keyed by queue name.
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        vec![
            (self.queue.name().to_string(), self.queue.metrics().snapshot()),
            (self.results.name().to_string(), self.results.metrics().snapshot()),
        ]
    }

    fn pending(&self, command: Command, completion: Option<Completion>) -> PendingCommand {
        PendingCommand {
            ticket: self.next_ticket.fetch_add(1, Ordering::Relaxed),
            command,
            completion,
        }
    }

    fn reject_processed(&self, command: &Command) -> RuntimeResult<()> {
        if command.is_processed() {
            warn!(pipeline = %self.name, command = %command, "Rejecting command that was already processed");
            return Err(RuntimeError::InvalidCommand(format!(
                "command '{command}' was already processed; submit a new command"
            )));
        }
        Ok(())
    }

    /// Best-effort enqueue; a full queue drops the command with a warning.
    /// A command that was already processed is rejected.
    pub fn submit(&self, command: Command) -> bool {
        if self.reject_processed(&command).is_err() {
            return false;
        }
        trace!(pipeline = %self.name, command = %command, "submitting command");
        self.queue.submit(self.pending(command, None))
    }

    /// Enqueue and wait up to `timeout` for the processed command.
    ///
    /// A full queue, or a command that does not complete in time, yields
    /// `RuntimeError::Timeout`. A timed-out command that is still queued is
    /// withdrawn; one already executing runs to completion unobserved.
    pub async fn submit_sync(&self, command: Command, timeout: Duration) -> RuntimeResult<Command> {
        self.reject_processed(&command)?;
        let name = command.name().to_string();
        let (tx, rx) = oneshot::channel();
        let pending = self.pending(command, Some(tx));
        let ticket = pending.ticket;

        if self.queue.try_push(pending).is_err() {
            self.queue.metrics().record_dropped();
            warn!(
                pipeline = %self.name,
                command = %name,
                "Command queue full, rejecting synchronous command"
            );
            return Err(RuntimeError::Timeout(format!(
                "command queue of '{}' is full",
                self.name
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(RuntimeError::Interrupted(format!(
                "command '{name}' was abandoned before completion"
            ))),
            Err(_elapsed) => {
                self.withdraw(ticket, &name);
                Err(RuntimeError::Timeout(format!(
                    "command '{name}' did not complete within {timeout:?}"
                )))
            }
        }
    }

    fn withdraw(&self, ticket: u64, name: &str) {
        match self.queue.remove_first(|p| p.ticket == ticket) {
            Some(_) => debug!(pipeline = %self.name, command = name, "timed-out command withdrawn"),
            None => debug!(
                pipeline = %self.name,
                command = name,
                "timed-out command already executing, result will only reach listeners"
            ),
        }
    }

    /// Remove every queued command, failing each with `Interrupted`.
    ///
    /// Returns the removed commands in queue order, each carrying its failure.
    pub fn clear(&self) -> Vec<Command> {
        let cleared: Vec<Command> = self
            .queue
            .drain()
            .into_iter()
            .map(|pending| pending.interrupt("removed by queue clear"))
            .collect();
        if !cleared.is_empty() {
            info!(pipeline = %self.name, count = cleared.len(), "Command queue cleared");
        }
        cleared
    }

    /// Change the ingress capacity.
    ///
    /// The backlog is cleared (as by [`clear`](Self::clear)) when
    /// `discard_backlog` is set or the capacity shrinks. Returns the number of
    /// commands removed.
    pub fn set_capacity(&self, capacity: usize, discard_backlog: bool) -> RuntimeResult<usize> {
        if capacity == 0 {
            return Err(RuntimeError::InvalidConfig(format!(
                "command queue capacity of '{}' must be strictly positive",
                self.name
            )));
        }
        let shrinking = capacity < self.queue.capacity();
        let mut removed = if discard_backlog || shrinking {
            self.clear().len()
        } else {
            0
        };
        // Commands submitted between the clear and the resize
        let overflow = self.queue.set_capacity(capacity)?;
        removed += overflow.len();
        for pending in overflow {
            pending.interrupt("removed by queue resize");
        }
        info!(pipeline = %self.name, capacity, removed, "Command queue capacity changed");
        Ok(removed)
    }

    /// Spawn the worker. It runs until `cancel` fires or a fatal condition
    /// stops it, in which case `on_fatal` is called once.
    pub fn spawn_worker<E: CommandExecutor>(
        &self,
        executor: Arc<E>,
        cancel: CancellationToken,
        on_fatal: FatalHandler,
    ) -> JoinHandle<()> {
        let name = self.name.clone();
        let queue = self.queue.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            debug!(pipeline = %name, "command worker started");
            while let Some(pending) = queue.take(&cancel).await {
                let step = AssertUnwindSafe(run_command(
                    executor.as_ref(),
                    pending,
                    &results,
                    queue.metrics(),
                ))
                .catch_unwind()
                .await;
                let outcome = step.unwrap_or_else(|payload| {
                    StepOutcome::StopFatal(FatalReason::WorkerPanicked {
                        pipeline: name.clone(),
                        message: DriverError::from_panic(payload).message().to_string(),
                    })
                });
                match outcome {
                    StepOutcome::Continue | StepOutcome::Recovered(_) => {}
                    StepOutcome::StopFatal(reason) => {
                        error!(pipeline = %name, "Command worker stopped: {}", reason);
                        on_fatal(reason);
                        break;
                    }
                }
            }
            debug!(pipeline = %name, "command worker exited");
        })
    }

    /// Spawn the result dispatcher calling `handler` for every processed
    /// command in processing order.
    pub fn spawn_dispatcher<H>(&self, cancel: CancellationToken, handler: H) -> JoinHandle<()>
    where
        H: Fn(Arc<Command>) + Send + Sync + 'static,
    {
        self.results.spawn(cancel, handler)
    }
}

async fn run_command<E: CommandExecutor>(
    executor: &E,
    pending: PendingCommand,
    results: &Dispatcher<Arc<Command>>,
    metrics: &PipelineMetrics,
) -> StepOutcome {
    let PendingCommand {
        mut command,
        completion,
        ..
    } = pending;

    let outcome = guarded(executor.execute(&command)).await;
    metrics.record_processed();

    let mut step = StepOutcome::Continue;
    match outcome {
        Ok(result) => {
            trace!(command = %command, "command succeeded");
            command.complete(result);
        }
        Err(err) => {
            metrics.record_failed();
            if let DriverError::Interrupted(msg) = &err {
                step = StepOutcome::StopFatal(FatalReason::Interrupted(msg.clone()));
            } else {
                step = StepOutcome::Recovered(err.clone());
            }
            warn!(command = %command, kind = %err.kind(), "Command failed: {}", err);
            command.fail(err);
        }
    }

    if AssertUnwindSafe(executor.after_command(&command))
        .catch_unwind()
        .await
        .is_err()
    {
        warn!(command = %command, "post-command hook panicked");
    }

    let command = Arc::new(command);
    if let Some(tx) = completion {
        // The waiter may have timed out and gone away
        let _ = tx.send(Ok(Command::clone(&command)));
    }

    match results.dispatch(command) {
        Ok(()) => step,
        Err(reason) => StepOutcome::StopFatal(reason),
    }
}
