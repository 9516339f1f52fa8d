//! Egress stage: decouples a worker from the listeners it notifies.
//!
//! A worker hands finished items to [`Dispatcher::dispatch`], which never
//! blocks. The dispatcher task drains them in order and runs the handler, so a
//! slow listener can only back up the egress queue, never the worker. If the
//! egress queue is full the item is lost and the caller receives
//! [`FatalReason::EgressOverflow`]; the owning pipeline must stop.

use super::metrics::PipelineMetrics;
use super::queue::BoundedQueue;
use crate::error::{FatalReason, RuntimeResult};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Bounded egress queue plus the task draining it.
#[derive(Debug)]
pub struct Dispatcher<T> {
    queue: Arc<BoundedQueue<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Create a dispatcher with an egress queue of `capacity` items.
    pub fn new(name: impl Into<String>, capacity: usize) -> RuntimeResult<Self> {
        let queue = BoundedQueue::new(name, capacity, Arc::new(PipelineMetrics::default()))?;
        Ok(Self {
            queue: Arc::new(queue),
        })
    }

    /// Pipeline name used in logs and fatal reasons.
    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// Egress counters.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        self.queue.metrics()
    }

    /// Items waiting for the handler.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Hand an item to the dispatcher without blocking.
    pub fn dispatch(&self, item: T) -> Result<(), FatalReason> {
        match self.queue.try_push(item) {
            Ok(()) => Ok(()),
            Err(_lost) => {
                self.queue.metrics().record_dropped();
                error!(
                    pipeline = %self.queue.name(),
                    capacity = self.queue.capacity(),
                    "Dispatch queue '{}' overflowed, item lost",
                    self.queue.name()
                );
                Err(FatalReason::EgressOverflow {
                    pipeline: self.queue.name().to_string(),
                })
            }
        }
    }

    /// Spawn the task running `handler` for every dispatched item, in order,
    /// until `cancel` fires.
    pub fn spawn<H>(&self, cancel: CancellationToken, handler: H) -> JoinHandle<()>
    where
        H: Fn(T) + Send + Sync + 'static,
    {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            debug!(pipeline = %queue.name(), "dispatcher started");
            while let Some(item) = queue.take(&cancel).await {
                handler(item);
                queue.metrics().record_processed();
            }
            debug!(pipeline = %queue.name(), "dispatcher stopped");
        })
    }
}
