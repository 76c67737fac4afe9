//! Per-run VM state

use std::collections::BTreeMap;

use dsl::{Guard, Value};

/// Memory table and accumulator of one run
///
/// Owned by a single run and shared only between that run's streams.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registers {
    memory: BTreeMap<String, Value>,
    accumulator: Value,
}

impl Registers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, key: impl Into<String>, value: Value) {
        self.memory.insert(key.into(), value);
    }

    /// Copy `Memory[key]` into the accumulator; an absent key loads `Empty`
    pub fn load(&mut self, key: &str) -> &Value {
        self.accumulator = self.memory.get(key).cloned().unwrap_or_default();
        &self.accumulator
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.memory.get(key)
    }

    pub fn accumulator(&self) -> &Value {
        &self.accumulator
    }

    pub fn set_accumulator(&mut self, value: Value) {
        self.accumulator = value;
    }

    pub fn memory(&self) -> &BTreeMap<String, Value> {
        &self.memory
    }

    /// Evaluate a BRANCH guard against the current registers
    pub fn matches(&self, guard: &Guard) -> bool {
        match guard {
            Guard::Default => true,
            Guard::Ok => self.accumulator.is_truthy(),
            Guard::Equals(text) => self.accumulator.to_string() == *text,
            Guard::Memory(key) => self.memory.get(key).is_some_and(Value::is_truthy),
        }
    }

    pub fn into_parts(self) -> (Value, BTreeMap<String, Value>) {
        (self.accumulator, self.memory)
    }
}

/// Lifecycle of one instruction stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Running,
    /// Suspended on a JOIN over this many branches
    AwaitingJoin(usize),
    Halted(Result<(), String>),
}

/// Where a stream goes after an instruction completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Goto(usize),
    Halt,
}

/// Program counter of one stream
#[derive(Debug, Clone)]
pub struct Stream {
    pc: usize,
    state: StreamState,
}

impl Stream {
    pub fn new(entry: usize) -> Self {
        Self {
            pc: entry,
            state: StreamState::Running,
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == StreamState::Running
    }

    pub fn await_join(&mut self, branches: usize) {
        self.state = StreamState::AwaitingJoin(branches);
    }

    pub fn resume(&mut self) {
        self.state = StreamState::Running;
    }

    /// Apply a completed instruction's transition
    pub fn advance(&mut self, transition: Transition) {
        match transition {
            Transition::Goto(target) => self.pc = target,
            Transition::Halt => self.state = StreamState::Halted(Ok(())),
        }
    }

    /// Halt with an error; the program counter stays on the failed instruction
    pub fn fail(&mut self, reason: String) {
        self.state = StreamState::Halted(Err(reason));
    }
}
