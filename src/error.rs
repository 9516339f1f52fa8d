//! Error types for the instrument runtime.
//!
//! Two layers of errors exist, both built with `thiserror`:
//!
//! - **`DriverError`**: what a controller or instrument driver reports back to the
//!   runtime. Every variant maps to exactly one [`ErrorKind`], which is what the
//!   runtime uses to classify a failure (e.g. whether a collection failure is
//!   tolerated for a given channel).
//! - **`RuntimeError`**: what the runtime's public API returns to callers, such as
//!   a synchronous command that timed out or an invalid configuration value.
//!
//! A third type, [`FatalReason`], describes why a pipeline stopped and the owning
//! runtime moved to the `Error` state.
//!
//! ## Error Kinds
//!
//! - **`Communication`**: transport or bus I/O failed.
//! - **`Timeout`**: a bounded wait was not satisfied.
//! - **`Unsupported`**: the driver does not implement the requested capability.
//! - **`Interrupted`**: a cooperative shutdown signal was observed.
//! - **`Unexpected`**: anything else, including a panic inside a driver call.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias for driver call results.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Convenience alias for results of runtime API calls.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport/bus I/O failure.
    Communication,
    /// A bounded wait was not satisfied.
    Timeout,
    /// The driver does not implement the requested capability.
    Unsupported,
    /// Cooperative shutdown signal.
    Interrupted,
    /// Anything else.
    Unexpected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication => write!(f, "communication"),
            Self::Timeout => write!(f, "timeout"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Unexpected => write!(f, "unexpected"),
        }
    }
}

/// Failure reported by a controller or instrument driver.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum DriverError {
    /// See [`ErrorKind::Communication`].
    #[error("Communication failure: {0}")]
    Communication(String),

    /// See [`ErrorKind::Timeout`].
    #[error("Timeout: {0}")]
    Timeout(String),

    /// See [`ErrorKind::Unsupported`].
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// See [`ErrorKind::Interrupted`].
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// See [`ErrorKind::Unexpected`].
    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

impl DriverError {
    /// Returns the classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Communication(_) => ErrorKind::Communication,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Interrupted(_) => ErrorKind::Interrupted,
            Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Returns the message carried by this failure.
    pub fn message(&self) -> &str {
        match self {
            Self::Communication(msg)
            | Self::Timeout(msg)
            | Self::Unsupported(msg)
            | Self::Interrupted(msg)
            | Self::Unexpected(msg) => msg,
        }
    }

    /// Builds an `Unexpected` failure from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "driver panicked".to_string()
        };
        Self::Unexpected(format!("panic: {msg}"))
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::TimedOut | Io::WouldBlock => Self::Timeout(err.to_string()),
            Io::Interrupted => Self::Interrupted(err.to_string()),
            Io::Unsupported => Self::Unsupported(err.to_string()),
            _ => Self::Communication(err.to_string()),
        }
    }
}

/// Why a pipeline stopped and drove its runtime into the `Error` state.
#[derive(Error, Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum FatalReason {
    /// A driver call reported `Interrupted`.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// A dispatch queue was full when a value had to be handed over.
    #[error("egress queue of pipeline '{pipeline}' overflowed")]
    EgressOverflow { pipeline: String },

    /// A failure whose kind the pipeline does not tolerate.
    #[error("untolerated failure in pipeline '{pipeline}': {error}")]
    Untolerated { pipeline: String, error: DriverError },

    /// The driver's `initialize` failed during start.
    #[error("initialization failed: {0}")]
    Initialization(DriverError),

    /// A pipeline worker panicked outside a driver call.
    #[error("worker of pipeline '{pipeline}' panicked: {message}")]
    WorkerPanicked { pipeline: String, message: String },
}

/// Errors returned by the runtime's public API.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A synchronous command was not processed in time, or its queue was full.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A waiting command was removed by a queue clear or abandoned.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A command does not match its schema, or was already processed.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The operation is not allowed in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The addressed pipeline is disabled in the configuration.
    #[error("Pipeline '{0}' is not enabled")]
    PipelineDisabled(String),

    /// The driver failed to initialize.
    #[error("Initialization failed: {0}")]
    Initialization(#[from] DriverError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_kind() {
        assert_eq!(
            DriverError::Timeout("no reply".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            DriverError::Unexpected("boom".into()).kind(),
            ErrorKind::Unexpected
        );
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Communication("GPIB bus not responding".to_string());
        assert_eq!(
            err.to_string(),
            "Communication failure: GPIB bus not responding"
        );
        assert_eq!(err.message(), "GPIB bus not responding");
    }

    #[test]
    fn test_io_error_mapping() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        assert_eq!(DriverError::from(timed_out).kind(), ErrorKind::Timeout);

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(DriverError::from(broken).kind(), ErrorKind::Communication);
    }

    #[test]
    fn test_panic_payload_message() {
        let err = DriverError::from_panic(Box::new("scope exploded"));
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(err.message().contains("scope exploded"));
    }

    #[test]
    fn test_driver_error_serde() {
        let err = DriverError::Unsupported("no readings".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "unsupported");
        let back: DriverError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_fatal_reason_display() {
        let reason = FatalReason::EgressOverflow {
            pipeline: "status".into(),
        };
        assert!(reason.to_string().contains("status"));

        let reason = FatalReason::WorkerPanicked {
            pipeline: "bus.commands".into(),
            message: DriverError::from_panic(Box::new("listener bug")).message().to_string(),
        };
        assert_eq!(
            reason.to_string(),
            "worker of pipeline 'bus.commands' panicked: panic: listener bug"
        );
    }
}
