//! Out-of-band debug events emitted by drivers.
//!
//! A driver holding a [`DebugSink`] can publish diagnostic events on numbered
//! channels; the owning runtime forwards them to every listener's `on_debug`.

use crate::command::ArgValue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Diagnostic event on a numbered channel with up to three payload values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEvent {
    /// Driver-defined channel number.
    pub channel: u32,
    /// At most [`MAX_PAYLOADS`](Self::MAX_PAYLOADS) values.
    pub payloads: Vec<ArgValue>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl DebugEvent {
    /// Maximum number of payload values per event.
    pub const MAX_PAYLOADS: usize = 3;

    /// Empty event on `channel`, stamped now.
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            payloads: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Append a payload; values beyond [`MAX_PAYLOADS`](Self::MAX_PAYLOADS)
    /// are discarded.
    pub fn with_payload(mut self, value: impl Into<ArgValue>) -> Self {
        if self.payloads.len() < Self::MAX_PAYLOADS {
            self.payloads.push(value.into());
        } else {
            trace!(channel = self.channel, "debug payload discarded");
        }
        self
    }
}

/// Cloneable handle for publishing debug events.
#[derive(Clone)]
pub struct DebugSink {
    emit: Arc<dyn Fn(DebugEvent) + Send + Sync>,
}

impl fmt::Debug for DebugSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSink").finish_non_exhaustive()
    }
}

impl DebugSink {
    pub(crate) fn new<F>(emit: F) -> Self
    where
        F: Fn(DebugEvent) + Send + Sync + 'static,
    {
        Self {
            emit: Arc::new(emit),
        }
    }

    /// Sink that discards everything; for drivers used outside a runtime.
    pub fn disconnected() -> Self {
        Self::new(|_| {})
    }

    /// Forward `event` to the sink's receiver.
    pub fn emit(&self, event: DebugEvent) {
        (self.emit)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_payload_limit() {
        let event = DebugEvent::new(4)
            .with_payload(1)
            .with_payload("two")
            .with_payload(3.0)
            .with_payload(false);
        assert_eq!(event.payloads.len(), DebugEvent::MAX_PAYLOADS);
        assert_eq!(event.payloads[1], ArgValue::from("two"));
    }

    #[test]
    fn test_sink_forwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            DebugSink::new(move |event| seen.lock().unwrap().push(event.channel))
        };
        sink.clone().emit(DebugEvent::new(7));
        sink.emit(DebugEvent::new(8));
        assert_eq!(*seen.lock().unwrap(), vec![7, 8]);

        DebugSink::disconnected().emit(DebugEvent::new(1));
    }
}
