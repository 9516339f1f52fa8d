//! Simulated bus controller for tests and the demo.
//!
//! Understands two commands:
//!
//! - `write { address: int, data: text }`: records `data` as the last message
//!   sent to `address`.
//! - `query { address: int, data: text }`: writes `data`, then answers with the
//!   configured response for `(address, data)`, or a `Timeout` failure if none
//!   is configured (no device answering).
//!
//! Latency and one-shot failure injection make it usable for backpressure and
//! failure-path tests.

use super::ControllerDriver;
use crate::command::{ArgKind, ArgValue, Command, CommandCatalog, CommandSchema};
use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Default)]
struct BusState {
    responses: HashMap<(i64, String), String>,
    written: Vec<(i64, String)>,
    failures: VecDeque<DriverError>,
}

/// In-memory bus controller.
#[derive(Debug, Default)]
pub struct MockBusController {
    latency: Duration,
    state: Mutex<BusState>,
}

impl MockBusController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every command.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer `query` messages `data` sent to `address` with `response`.
    pub fn set_response(&self, address: i64, data: &str, response: &str) {
        self.state
            .lock()
            .responses
            .insert((address, data.to_string()), response.to_string());
    }

    /// Fail the next command with `error`. Calls stack in FIFO order.
    pub fn fail_next(&self, error: DriverError) {
        self.state.lock().failures.push_back(error);
    }

    /// Every `(address, data)` written so far, in order.
    pub fn written(&self) -> Vec<(i64, String)> {
        self.state.lock().written.clone()
    }
}

#[async_trait]
impl ControllerDriver for MockBusController {
    fn controller_type(&self) -> &str {
        "mockbus"
    }

    fn command_catalog(&self) -> CommandCatalog {
        CommandCatalog::new()
            .with(
                CommandSchema::new("write")
                    .required("address", ArgKind::Int)
                    .required("data", ArgKind::Text)
                    .describe("Send a message to a device"),
            )
            .with(
                CommandSchema::new("query")
                    .required("address", ArgKind::Int)
                    .required("data", ArgKind::Text)
                    .describe("Send a message and read the reply"),
            )
    }

    async fn process_command(&self, command: &Command) -> DriverResult<Option<ArgValue>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.state.lock().failures.pop_front() {
            return Err(error);
        }

        let address = command.arg_i64("address")?;
        let data = command.arg_str("data")?.to_string();
        trace!(address, data = %data, command = command.name(), "bus transfer");

        let mut state = self.state.lock();
        state.written.push((address, data.clone()));
        match command.name() {
            "write" => Ok(None),
            "query" => state
                .responses
                .get(&(address, data))
                .map(|reply| Some(ArgValue::from(reply.as_str())))
                .ok_or_else(|| {
                    DriverError::Timeout(format!("no reply from device at address {address}"))
                }),
            other => Err(DriverError::Unsupported(format!(
                "bus command '{other}'"
            ))),
        }
    }
}
