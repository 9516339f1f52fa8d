//! Bounded FIFO queue feeding a single pipeline worker.
//!
//! Producers never block: [`BoundedQueue::submit`] drops the item and logs a
//! warning when the queue is at capacity, while [`BoundedQueue::try_push`] hands
//! the item back so callers with stronger delivery requirements (synchronous
//! commands, dispatch queues) can react. The worker side waits in
//! [`BoundedQueue::take`] until an item arrives or the pipeline is cancelled.
//!
//! Capacity can be changed at runtime; it is always strictly positive.

use super::metrics::PipelineMetrics;
use crate::error::{RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Thread-safe bounded FIFO with drop-on-overflow submission.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    name: String,
    items: Mutex<VecDeque<T>>,
    capacity: AtomicUsize,
    available: Notify,
    metrics: Arc<PipelineMetrics>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue. Fails if `capacity` is zero.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        metrics: Arc<PipelineMetrics>,
    ) -> RuntimeResult<Self> {
        let name = name.into();
        check_capacity(&name, capacity)?;
        Ok(Self {
            name,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: AtomicUsize::new(capacity),
            available: Notify::new(),
            metrics,
        })
    }

    /// Queue name, used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Counters shared with the owning pipeline.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Enqueue without blocking, handing the item back if the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity.load(Ordering::Acquire) {
                return Err(item);
            }
            items.push_back(item);
        }
        self.metrics.record_accepted();
        self.available.notify_one();
        Ok(())
    }

    /// Best-effort enqueue: drops the item with a warning when full.
    ///
    /// Returns `true` if the item was accepted.
    pub fn submit(&self, item: T) -> bool {
        match self.try_push(item) {
            Ok(()) => {
                trace!(queue = %self.name, "item queued");
                true
            }
            Err(_dropped) => {
                self.metrics.record_dropped();
                warn!(
                    queue = %self.name,
                    capacity = self.capacity(),
                    "Queue '{}' full, dropping item",
                    self.name
                );
                false
            }
        }
    }

    /// Wait for the next item, or `None` once `cancel` fires.
    ///
    /// Cancellation is checked before every hand-out, so no item is returned
    /// after the token has been observed as cancelled.
    pub async fn take(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = self.available.notified() => {}
            }
        }
    }

    /// Remove and return every queued item in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Remove the first queued item matching `pred`.
    pub fn remove_first<F>(&self, pred: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut items = self.items.lock();
        let index = items.iter().position(pred)?;
        items.remove(index)
    }

    /// Change the capacity, returning queued items beyond the new capacity
    /// (newest first removed, returned in FIFO order).
    pub fn set_capacity(&self, capacity: usize) -> RuntimeResult<Vec<T>> {
        check_capacity(&self.name, capacity)?;
        let mut items = self.items.lock();
        self.capacity.store(capacity, Ordering::Release);
        let overflow = if items.len() > capacity {
            items.split_off(capacity).into_iter().collect()
        } else {
            Vec::new()
        };
        Ok(overflow)
    }
}

fn check_capacity(name: &str, capacity: usize) -> RuntimeResult<()> {
    if capacity == 0 {
        return Err(RuntimeError::InvalidConfig(format!(
            "capacity of queue '{name}' must be strictly positive"
        )));
    }
    Ok(())
}
