//! Commands and their typed arguments.
//!
//! A [`Command`] is a named operation with a map of typed arguments. Once a
//! worker has processed it, the command carries a [`CommandOutcome`] with
//! either a result value or the failure reported by the driver. Each command is
//! processed at most once.
//!
//! Drivers describe the commands they understand with a [`CommandCatalog`];
//! [`CommandBuilder::build`] validates names, argument presence, and argument
//! types against it before a command ever reaches a queue.
//!
//! # Example
//!
//! ```
//! use lab_control::command::{ArgKind, Command, CommandCatalog, CommandSchema};
//!
//! let catalog = CommandCatalog::new()
//!     .with(CommandSchema::new("set_timebase").required("seconds", ArgKind::Float));
//!
//! let command = Command::builder("set_timebase")
//!     .arg("seconds", 1.0e-3)
//!     .build(&catalog)
//!     .unwrap();
//! assert_eq!(command.arg_f64("seconds").unwrap(), 1.0e-3);
//!
//! assert!(Command::builder("set_timebase").build(&catalog).is_err());
//! ```

use crate::error::{DriverError, DriverResult, RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Argument values
// ============================================================================

/// Typed command argument or result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ArgValue {
    /// Type of this value.
    pub fn kind(&self) -> ArgKind {
        match self {
            Self::Bool(_) => ArgKind::Bool,
            Self::Int(_) => ArgKind::Int,
            Self::Float(_) => ArgKind::Float,
            Self::Text(_) => ArgKind::Text,
            Self::Bytes(_) => ArgKind::Bytes,
        }
    }

    /// Boolean value, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Float value; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Text value, if this is `Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes; `Text` yields its UTF-8 encoding.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for ArgValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Declared type of a command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
}

impl ArgKind {
    /// Whether `value` is acceptable for an argument of this kind.
    ///
    /// `Float` accepts integers.
    pub fn accepts(self, value: &ArgValue) -> bool {
        matches!(
            (self, value),
            (Self::Bool, ArgValue::Bool(_))
                | (Self::Int, ArgValue::Int(_))
                | (Self::Float, ArgValue::Float(_) | ArgValue::Int(_))
                | (Self::Text, ArgValue::Text(_))
                | (Self::Bytes, ArgValue::Bytes(_))
        )
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Commands
// ============================================================================

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(u64);

impl CommandId {
    fn next() -> Self {
        Self(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw sequence number.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What happened when a command was processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub result: Option<ArgValue>,
    pub failure: Option<DriverError>,
}

/// A named operation with typed arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: CommandId,
    name: String,
    args: BTreeMap<String, ArgValue>,
    outcome: Option<CommandOutcome>,
}

impl Command {
    /// Unvalidated command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: CommandId::next(),
            name: name.into(),
            args: BTreeMap::new(),
            outcome: None,
        }
    }

    /// Start building a command validated against a catalog.
    pub fn builder(name: impl Into<String>) -> CommandBuilder {
        CommandBuilder {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add an argument (unvalidated).
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Unique id, shared by clones of this command.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Command name, matched against the driver's catalog.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All arguments, ordered by key.
    pub fn args(&self) -> &BTreeMap<String, ArgValue> {
        &self.args
    }

    /// Argument `key`, if present.
    pub fn arg(&self, key: &str) -> Option<&ArgValue> {
        self.args.get(key)
    }

    /// Float argument for driver code; a missing or mistyped argument is an
    /// `Unexpected` driver failure.
    pub fn arg_f64(&self, key: &str) -> DriverResult<f64> {
        self.arg(key)
            .and_then(ArgValue::as_f64)
            .ok_or_else(|| self.bad_arg(key, ArgKind::Float))
    }

    /// Integer argument `key`, failing like [`arg_f64`](Self::arg_f64).
    pub fn arg_i64(&self, key: &str) -> DriverResult<i64> {
        self.arg(key)
            .and_then(ArgValue::as_i64)
            .ok_or_else(|| self.bad_arg(key, ArgKind::Int))
    }

    /// Boolean argument `key`, failing like [`arg_f64`](Self::arg_f64).
    pub fn arg_bool(&self, key: &str) -> DriverResult<bool> {
        self.arg(key)
            .and_then(ArgValue::as_bool)
            .ok_or_else(|| self.bad_arg(key, ArgKind::Bool))
    }

    /// String argument `key`, failing like [`arg_f64`](Self::arg_f64).
    pub fn arg_str(&self, key: &str) -> DriverResult<&str> {
        self.arg(key)
            .and_then(ArgValue::as_str)
            .ok_or_else(|| self.bad_arg(key, ArgKind::Text))
    }

    fn bad_arg(&self, key: &str, kind: ArgKind) -> DriverError {
        DriverError::Unexpected(format!(
            "command '{}' needs {kind} argument '{key}'",
            self.name
        ))
    }

    /// Outcome, once processed (or removed by a queue clear).
    pub fn outcome(&self) -> Option<&CommandOutcome> {
        self.outcome.as_ref()
    }

    /// Whether the command has been executed or failed.
    pub fn is_processed(&self) -> bool {
        self.outcome.is_some()
    }

    /// `Some(true)` on success, `Some(false)` on failure, `None` if unprocessed.
    pub fn succeeded(&self) -> Option<bool> {
        self.outcome.as_ref().map(|o| o.success)
    }

    /// Result value of a successful command.
    pub fn result(&self) -> Option<&ArgValue> {
        self.outcome.as_ref().and_then(|o| o.result.as_ref())
    }

    /// Failure of an unsuccessful command.
    pub fn failure(&self) -> Option<&DriverError> {
        self.outcome.as_ref().and_then(|o| o.failure.as_ref())
    }

    pub(crate) fn complete(&mut self, result: Option<ArgValue>) {
        debug_assert!(self.outcome.is_none(), "command processed twice");
        self.outcome = Some(CommandOutcome {
            success: true,
            result,
            failure: None,
        });
    }

    pub(crate) fn fail(&mut self, error: DriverError) {
        debug_assert!(self.outcome.is_none(), "command processed twice");
        self.outcome = Some(CommandOutcome {
            success: false,
            result: None,
            failure: Some(error),
        });
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}(", self.name, self.id)?;
        for (i, (key, value)) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str(")")
    }
}

// ============================================================================
// Catalog and validation
// ============================================================================

/// Declared shape of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSchema {
    name: String,
    description: Option<String>,
    required: BTreeMap<String, ArgKind>,
    optional: BTreeMap<String, ArgKind>,
}

impl CommandSchema {
    /// Schema for command `name` with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            required: BTreeMap::new(),
            optional: BTreeMap::new(),
        }
    }

    /// Add a required argument of type `kind`.
    pub fn required(mut self, key: impl Into<String>, kind: ArgKind) -> Self {
        self.required.insert(key.into(), kind);
        self
    }

    /// Add an optional argument of type `kind`.
    pub fn optional(mut self, key: impl Into<String>, kind: ArgKind) -> Self {
        self.optional.insert(key.into(), kind);
        self
    }

    /// Attach a human-readable description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description, if one was attached.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn validate(&self, args: &BTreeMap<String, ArgValue>) -> RuntimeResult<()> {
        for (key, kind) in &self.required {
            match args.get(key) {
                None => {
                    return Err(RuntimeError::InvalidCommand(format!(
                        "'{}' is missing required argument '{key}'",
                        self.name
                    )))
                }
                Some(value) if !kind.accepts(value) => {
                    return Err(mistyped(&self.name, key, *kind, value))
                }
                Some(_) => {}
            }
        }
        for (key, value) in args {
            if self.required.contains_key(key) {
                continue;
            }
            match self.optional.get(key) {
                None => {
                    return Err(RuntimeError::InvalidCommand(format!(
                        "'{}' does not take argument '{key}'",
                        self.name
                    )))
                }
                Some(kind) if !kind.accepts(value) => {
                    return Err(mistyped(&self.name, key, *kind, value))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn mistyped(command: &str, key: &str, expected: ArgKind, value: &ArgValue) -> RuntimeError {
    RuntimeError::InvalidCommand(format!(
        "'{command}' argument '{key}' must be {expected}, got {}",
        value.kind()
    ))
}

/// The set of commands a driver understands.
///
/// An empty catalog accepts every command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandCatalog {
    schemas: BTreeMap<String, CommandSchema>,
}

impl CommandCatalog {
    /// Empty catalog, which accepts any command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, schema: CommandSchema) -> Self {
        self.register(schema);
        self
    }

    /// Register a schema, replacing one with the same name.
    pub fn register(&mut self, schema: CommandSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Schema for command `name`.
    pub fn get(&self, name: &str) -> Option<&CommandSchema> {
        self.schemas.get(name)
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Whether no schema is registered.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Check a command against its schema.
    pub fn validate(&self, command: &Command) -> RuntimeResult<()> {
        if self.is_empty() {
            return Ok(());
        }
        let schema = self.get(command.name()).ok_or_else(|| {
            RuntimeError::InvalidCommand(format!("unknown command '{}'", command.name()))
        })?;
        schema.validate(command.args())
    }
}

/// Accumulates arguments, then validates against a catalog.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    name: String,
    args: BTreeMap<String, ArgValue>,
}

impl CommandBuilder {
    /// Set argument `key`.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Validate and produce the command.
    pub fn build(self, catalog: &CommandCatalog) -> RuntimeResult<Command> {
        let command = self.build_unchecked();
        catalog.validate(&command)?;
        Ok(command)
    }

    /// Produce the command without validation.
    pub fn build_unchecked(self) -> Command {
        let mut command = Command::new(self.name);
        command.args = self.args;
        command
    }
}
