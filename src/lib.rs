//! Concurrent service runtime for bus-attached laboratory test instruments.
//!
//! The crate is organised in three layers:
//!
//! - [`controller`]: a bus controller (GPIB board, serial hub, ...) running
//!   commands one at a time through a [`ControllerDriver`](controller::ControllerDriver).
//! - a [`Device`](controller::Device): an address on a controller's bus.
//! - [`instrument`]: an instrument on a device, running command, status,
//!   settings, reading, and housekeeping pipelines through an
//!   [`InstrumentDriver`](instrument::InstrumentDriver).
//!
//! Every runtime moves through [`ServiceState`](service::ServiceState)
//! `Created → Active → (Error) → Stopped` and reports results to listeners
//! from dedicated dispatcher tasks. Ingress queues drop new items with a
//! warning when full; an egress overflow moves the runtime to `Error`.

pub mod command;
pub mod config;
pub mod controller;
pub mod debug;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod pipeline;
pub mod service;
pub mod url;

pub use command::{ArgKind, ArgValue, Command, CommandCatalog, CommandSchema};
pub use config::{AcquisitionMode, ControllerConfig, InstrumentConfig, LabConfig};
pub use controller::{ControllerDriver, ControllerListener, ControllerRuntime, Device};
pub use error::{DriverError, DriverResult, ErrorKind, FatalReason, RuntimeError, RuntimeResult};
pub use instrument::{InstrumentDriver, InstrumentListener, InstrumentRuntime, ValueFeed};
pub use service::ServiceState;
