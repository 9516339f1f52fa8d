//! Acquisition channels: collector side, dispatch queue, and held value.
//!
//! A channel carries one kind of value (status, settings, or readings) from
//! the driver to listeners. Values enter through [`ValueFeed::push`], either
//! from the runtime's periodic collector or directly from the driver, and are
//! handed to a dispatcher that optionally compares against the held value
//! before notifying listeners.

use crate::error::{FatalReason, RuntimeResult};
use crate::pipeline::{
    spawn_periodic, Dispatcher, FatalHandler, MetricsSnapshot, PipelineMetrics, StepOutcome,
};
use crate::service::ServiceStatus;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Which acquisition channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Instrument status, suppressed when unchanged.
    Status,
    /// Instrument settings, optionally suppressed when unchanged.
    Settings,
    /// Measurement readings, never suppressed.
    Reading,
}

impl ChannelKind {
    /// Lowercase name used in pipeline names and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Settings => "settings",
            Self::Reading => "reading",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) struct Channel<T> {
    kind: ChannelKind,
    name: String,
    dispatcher: Dispatcher<Arc<T>>,
    collector_metrics: Arc<PipelineMetrics>,
    current: Mutex<Option<Arc<T>>>,
    feed_token: Mutex<CancellationToken>,
    status: Arc<ServiceStatus>,
}

impl<T: Send + Sync + 'static> Channel<T> {
    pub(crate) fn new(
        kind: ChannelKind,
        instrument_url: &str,
        capacity: usize,
        status: Arc<ServiceStatus>,
    ) -> RuntimeResult<Self> {
        let name = format!("{instrument_url}.{kind}");
        Ok(Self {
            kind,
            dispatcher: Dispatcher::new(format!("{name}.dispatch"), capacity)?,
            name,
            collector_metrics: Arc::new(PipelineMetrics::default()),
            current: Mutex::new(None),
            feed_token: Mutex::new(CancellationToken::new()),
            status,
        })
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn current(&self) -> Option<Arc<T>> {
        self.current.lock().clone()
    }

    pub(crate) fn feed(self: &Arc<Self>) -> ValueFeed<T> {
        ValueFeed {
            channel: self.clone(),
        }
    }

    pub(crate) fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        vec![
            (self.name.clone(), self.collector_metrics.snapshot()),
            (
                self.dispatcher.name().to_string(),
                self.dispatcher.metrics().snapshot(),
            ),
        ]
    }

    /// Bind the feed to a fresh child of `parent` and return it.
    pub(crate) fn rearm(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        *self.feed_token.lock() = token.clone();
        token
    }

    fn push(&self, value: T) -> Result<(), FatalReason> {
        let token = self.feed_token.lock().clone();
        if token.is_cancelled() {
            return Err(FatalReason::Interrupted(format!(
                "{} pipeline is not running",
                self.name
            )));
        }
        match self.dispatcher.dispatch(Arc::new(value)) {
            Ok(()) => {
                self.collector_metrics.record_accepted();
                Ok(())
            }
            Err(reason) => {
                token.cancel();
                self.status.fail(self.kind.name(), reason.clone());
                Err(reason)
            }
        }
    }

    /// Spawn the dispatcher.
    ///
    /// With `suppress`, the channel holds the latest delivered value; a new
    /// value for which `suppress(held, new)` is true is discarded. Without it
    /// nothing is held and every value is delivered.
    pub(crate) fn spawn_dispatcher<S, F>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        suppress: Option<S>,
        deliver: F,
    ) -> JoinHandle<()>
    where
        S: Fn(&T, &T) -> bool + Send + Sync + 'static,
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        let channel = self.clone();
        self.dispatcher.spawn(cancel, move |value: Arc<T>| {
            if let Some(suppress) = &suppress {
                let unchanged = {
                    let mut current = channel.current.lock();
                    let unchanged = current
                        .as_deref()
                        .is_some_and(|held| suppress(held, &value));
                    if !unchanged {
                        *current = Some(value.clone());
                    }
                    unchanged
                };
                if unchanged {
                    trace!(pipeline = %channel.name, "unchanged value suppressed");
                    return;
                }
            }
            deliver(&value);
        })
    }

    /// Spawn the periodic collector.
    pub(crate) fn spawn_collector<P, A, Fut>(
        &self,
        cancel: CancellationToken,
        period: P,
        on_fatal: FatalHandler,
        action: A,
    ) -> JoinHandle<()>
    where
        P: Fn() -> Duration + Send + Sync + 'static,
        A: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutcome> + Send + 'static,
    {
        spawn_periodic(
            self.name.clone(),
            period,
            cancel,
            self.collector_metrics.clone(),
            on_fatal,
            action,
        )
    }
}

/// Entry point through which values reach a channel's dispatcher.
///
/// Handed to drivers in `request_*` calls and available from the runtime for
/// push-mode drivers. Pushing never blocks; if the dispatch queue is full the
/// value is lost, the channel stops accepting values and the instrument enters
/// `Error`.
pub struct ValueFeed<T> {
    channel: Arc<Channel<T>>,
}

impl<T> Clone for ValueFeed<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<T> fmt::Debug for ValueFeed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueFeed")
            .field("channel", &self.channel.name)
            .finish()
    }
}

impl<T: Send + Sync + 'static> ValueFeed<T> {
    /// Hand a value to the dispatcher.
    pub fn push(&self, value: T) -> Result<(), FatalReason> {
        self.channel.push(value)
    }

    /// Whether the channel stopped accepting values.
    pub fn is_closed(&self) -> bool {
        self.channel.feed_token.lock().is_cancelled()
    }

    /// Which channel this feed delivers to.
    pub fn kind(&self) -> ChannelKind {
        self.channel.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceState;
    use std::time::Duration;

    fn channel(capacity: usize) -> (Arc<Channel<u32>>, Arc<ServiceStatus>) {
        let status = Arc::new(ServiceStatus::new("probe"));
        status.activate().unwrap();
        let channel =
            Arc::new(Channel::new(ChannelKind::Status, "probe@bus#1", capacity, status.clone()).unwrap());
        (channel, status)
    }

    #[tokio::test]
    async fn test_suppression_and_held_value() {
        let (channel, _status) = channel(8);
        let cancel = CancellationToken::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        {
            let delivered = delivered.clone();
            channel.spawn_dispatcher(
                cancel.clone(),
                Some(|a: &u32, b: &u32| a == b),
                move |v: &Arc<u32>| delivered.lock().push(**v),
            );
        }

        let feed = channel.feed();
        for v in [1, 1, 1, 2, 2, 1] {
            feed.push(v).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while channel.dispatcher.pending() > 0 || delivered.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*delivered.lock(), vec![1, 2, 1]);
        assert_eq!(channel.current().as_deref(), Some(&1));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_without_suppression_nothing_is_held() {
        let (channel, _status) = channel(8);
        let cancel = CancellationToken::new();
        let delivered = Arc::new(Mutex::new(0usize));
        {
            let delivered = delivered.clone();
            channel.spawn_dispatcher(
                cancel.clone(),
                None::<fn(&u32, &u32) -> bool>,
                move |_: &Arc<u32>| *delivered.lock() += 1,
            );
        }

        let feed = channel.feed();
        for _ in 0..4 {
            feed.push(7).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while *delivered.lock() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(channel.current().is_none());
        cancel.cancel();
    }

    #[test]
    fn test_overflow_closes_feed_and_fails_instrument() {
        let (channel, status) = channel(1);
        let feed = channel.feed();
        feed.push(1).unwrap();

        let err = feed.push(2).unwrap_err();
        assert!(matches!(err, FatalReason::EgressOverflow { .. }));
        assert!(feed.is_closed());
        assert_eq!(status.state(), ServiceState::Error);

        // Closed feeds reject further values without another fatal report
        assert!(matches!(feed.push(3), Err(FatalReason::Interrupted(_))));
    }

    #[test]
    fn test_rearm_reopens_feed() {
        let (channel, _status) = channel(4);
        let parent = CancellationToken::new();
        let feed = channel.feed();

        let first = channel.rearm(&parent);
        parent.cancel();
        assert!(first.is_cancelled());
        assert!(feed.is_closed());

        channel.rearm(&CancellationToken::new());
        assert!(!feed.is_closed());
        feed.push(5).unwrap();
    }
}
