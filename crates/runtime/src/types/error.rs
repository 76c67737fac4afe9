//! Error types for the Boogie runtime

use std::time::Duration;
use thiserror::Error;

use dsl::{DslError, OperandError, Opcode};

use crate::scheduler::circuit_breaker::CircuitOpenError;

/// Main runtime error type
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Compilation failed: {0}")]
    Dsl(#[from] DslError),

    #[error("Execution error: {0}")]
    Vm(#[from] VmError),
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Fatal errors of a program run
///
/// Every variant names the instruction index (`pc`) it happened at.
#[derive(Error, Debug, Clone)]
pub enum VmError {
    #[error("{opcode} at instruction {pc}: {source}")]
    Operand {
        pc: usize,
        opcode: Opcode,
        #[source]
        source: OperandError,
    },

    #[error("{opcode} at instruction {pc}: target {target} is out of bounds for {len} instructions")]
    OutOfBounds {
        pc: usize,
        opcode: Opcode,
        target: usize,
        len: usize,
    },

    #[error("entry {entry} is out of bounds for {len} instructions")]
    InvalidEntry { entry: usize, len: usize },

    #[error("{opcode} '{name}' at instruction {pc}: no handler registered")]
    UnregisteredOperation {
        pc: usize,
        opcode: Opcode,
        name: String,
    },

    #[error("{opcode} '{name}' at instruction {pc} failed: {source}")]
    Dispatch {
        pc: usize,
        opcode: Opcode,
        name: String,
        #[source]
        source: DispatchError,
    },

    #[error("{opcode} '{name}' at instruction {pc} timed out after {timeout:?}")]
    Timeout {
        pc: usize,
        opcode: Opcode,
        name: String,
        timeout: Duration,
    },

    #[error("SPAWN '{name}' at instruction {pc} returned undeclared outcome '{outcome}' (declared: {declared})")]
    UndeclaredOutcome {
        pc: usize,
        name: String,
        outcome: String,
        declared: String,
    },

    #[error("JOIN at instruction {pc} failed in branch {branch} (entry {entry}): {source}")]
    JoinFailed {
        pc: usize,
        branch: usize,
        entry: usize,
        #[source]
        source: Box<VmError>,
    },

    #[error("SEND to '{target}' at instruction {pc} failed: {source}")]
    Send {
        pc: usize,
        target: String,
        #[source]
        source: SchedulerError,
    },

    #[error("RECEIVE on '{group}' at instruction {pc} failed: {source}")]
    Receive {
        pc: usize,
        group: String,
        #[source]
        source: SchedulerError,
    },

    #[error("run cancelled at instruction {pc}")]
    Cancelled { pc: usize },

    #[error("step budget of {limit} exhausted at instruction {pc}")]
    StepLimit { pc: usize, limit: usize },

    #[error("run aborted: {reason}")]
    Aborted { reason: String },
}

impl VmError {
    /// Index of the instruction that failed, if the failure is tied to one
    pub fn pc(&self) -> Option<usize> {
        match self {
            VmError::Operand { pc, .. }
            | VmError::OutOfBounds { pc, .. }
            | VmError::UnregisteredOperation { pc, .. }
            | VmError::Dispatch { pc, .. }
            | VmError::Timeout { pc, .. }
            | VmError::UndeclaredOutcome { pc, .. }
            | VmError::JoinFailed { pc, .. }
            | VmError::Send { pc, .. }
            | VmError::Receive { pc, .. }
            | VmError::Cancelled { pc }
            | VmError::StepLimit { pc, .. } => Some(*pc),
            VmError::InvalidEntry { entry, .. } => Some(*entry),
            VmError::Aborted { .. } => None,
        }
    }

    /// The innermost error, looking through failed joins
    pub fn root_cause(&self) -> &VmError {
        match self {
            VmError::JoinFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), VmError::Cancelled { .. })
    }
}

/// Errors returned by operation handlers
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("no handler registered for operation '{name}'")]
    NotRegistered { name: String },

    #[error("operation '{name}' was cancelled")]
    Cancelled { name: String },

    #[error("operation '{name}' failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Scheduling pool errors
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("no worker available for '{key}' within {timeout:?}")]
    Overloaded { key: String, timeout: Duration },

    #[error("work '{key}' timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("work '{key}' failed: {reason}")]
    WorkFailed { key: String, reason: String },

    #[error("work '{key}' was aborted before completing")]
    Aborted { key: String },

    #[error("work '{key}' was cancelled")]
    Cancelled { key: String },

    #[error("no live broadcast group '{group}'")]
    GroupNotFound { group: String },

    #[error("broadcast group '{group}' has no subscribers")]
    NoSubscribers { group: String },

    #[error("broadcast group '{group}' was closed")]
    GroupClosed { group: String },

    #[error("subscriber on '{group}' lagged behind by {skipped} message(s)")]
    Lagged { group: String, skipped: u64 },

    #[error("nothing received on '{group}' within {timeout:?}")]
    ReceiveTimeout { group: String, timeout: Duration },

    #[error("Scheduler shutdown in progress")]
    ShuttingDown,
}

impl SchedulerError {
    /// Whether this failure counts against the target's circuit breaker
    pub fn counts_against_target(&self) -> bool {
        !matches!(
            self,
            SchedulerError::CircuitOpen(_)
                | SchedulerError::Overloaded { .. }
                | SchedulerError::Cancelled { .. }
                | SchedulerError::ShuttingDown
        )
    }
}
