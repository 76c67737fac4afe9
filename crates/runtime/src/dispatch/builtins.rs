//! Built-in operation handlers

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dsl::Value;

use super::{DispatchOutcome, HandlerRegistry, OperationHandler, OperationRequest};
use crate::scheduler::SchedulingPool;
use crate::types::DispatchError;

/// Continues with the first declared outcome, leaving the accumulator as is
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughHandler;

#[async_trait]
impl OperationHandler for PassThroughHandler {
    async fn handle(&self, request: &OperationRequest) -> Result<DispatchOutcome, DispatchError> {
        Ok(DispatchOutcome::new(request.first_outcome(), request.input.clone()))
    }
}

/// Fails the current branch
#[derive(Debug, Default, Clone, Copy)]
pub struct CancelHandler;

#[async_trait]
impl OperationHandler for CancelHandler {
    async fn handle(&self, request: &OperationRequest) -> Result<DispatchOutcome, DispatchError> {
        Err(DispatchError::Cancelled {
            name: request.name.clone(),
        })
    }
}

/// Routes a message to another agent through the scheduling pool
///
/// The target is the behavior (`send<reviewer>`) or the `to` parameter.
/// The payload is the `payload` or first positional parameter, otherwise the
/// accumulator. Without a target, `send` is only an outcome label and passes
/// through.
pub struct SendHandler {
    pool: Arc<SchedulingPool>,
}

impl SendHandler {
    pub fn new(pool: Arc<SchedulingPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OperationHandler for SendHandler {
    async fn handle(&self, request: &OperationRequest) -> Result<DispatchOutcome, DispatchError> {
        let target = request
            .behavior
            .as_deref()
            .or_else(|| request.parameter("to"));
        let Some(target) = target else {
            tracing::debug!("'{}' has no target, continuing", request.name);
            return Ok(DispatchOutcome::new(request.first_outcome(), request.input.clone()));
        };

        let payload = request
            .parameter("payload")
            .or_else(|| request.parameter("arg0"))
            .map(Value::from)
            .unwrap_or_else(|| request.input.clone());

        let delivered = self.pool.send(target, payload).await?;
        tracing::debug!("'{}' delivered to {} subscriber(s) of '{}'", request.name, delivered, target);
        Ok(DispatchOutcome::new(request.first_outcome(), request.input.clone()))
    }
}

/// Register the built-in operations on `registry`
pub fn register_builtins(registry: &HandlerRegistry, pool: Arc<SchedulingPool>) {
    let pass = Arc::new(PassThroughHandler);
    registry.register("next", pass.clone());
    registry.register("ok", pass.clone());
    // the retry edge is compiled into the bytecode
    registry.register("back", pass);
    registry.register("cancel", Arc::new(CancelHandler));
    registry.register("send", Arc::new(SendHandler::new(pool)));
}

#[derive(Debug, Clone)]
enum Script {
    Respond(DispatchOutcome),
    Fail(String),
}

/// Deterministic handler for tests and dry runs
///
/// Unscripted operations resolve to their first declared outcome with the
/// operation name as value. Scripted responses are consumed in order; the
/// last one repeats.
#[derive(Default)]
pub struct ScriptedHandler {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<OperationRequest>>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `name`
    pub fn respond(self, name: &str, outcome: &str, value: impl Into<Value>) -> Self {
        self.push(name, Script::Respond(DispatchOutcome::new(outcome, value)));
        self
    }

    /// Queue a failure for `name`
    pub fn fail(self, name: &str, reason: &str) -> Self {
        self.push(name, Script::Fail(reason.to_string()));
        self
    }

    fn push(&self, name: &str, script: Script) {
        self.scripts
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(script);
    }

    /// Every request seen so far, in call order
    pub fn calls(&self) -> Vec<OperationRequest> {
        self.calls.lock().clone()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|r| r.name.clone()).collect()
    }

    fn next_script(&self, name: &str) -> Option<Script> {
        let mut scripts = self.scripts.lock();
        let queue = scripts.get_mut(name)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl OperationHandler for ScriptedHandler {
    async fn handle(&self, request: &OperationRequest) -> Result<DispatchOutcome, DispatchError> {
        self.calls.lock().push(request.clone());

        match self.next_script(&request.name) {
            Some(Script::Respond(outcome)) => Ok(outcome),
            Some(Script::Fail(reason)) => Err(DispatchError::Failed {
                name: request.name.clone(),
                reason,
            }),
            None => Ok(DispatchOutcome::new(
                request.first_outcome(),
                Value::from(request.name.as_str()),
            )),
        }
    }
}
