//! Operation dispatch
//!
//! The executor hands every SPAWN and CALL to a [`Dispatcher`]. The default
//! dispatcher is a [`HandlerRegistry`] mapping operation names to
//! [`OperationHandler`]s, with an optional fallback for names nobody claimed.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dsl::{OperationOperands, Value};

use crate::types::DispatchError;

pub mod builtins;

pub use builtins::{register_builtins, CancelHandler, PassThroughHandler, ScriptedHandler, SendHandler};

/// One operation invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub name: String,
    pub behavior: Option<String>,
    pub parameters: BTreeMap<String, String>,
    /// Outcomes declared in the program, in source order
    pub outcomes: Vec<String>,
    /// Accumulator at the time of the call
    pub input: Value,
}

impl OperationRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: None,
            parameters: BTreeMap::new(),
            outcomes: Vec::new(),
            input: Value::Empty,
        }
    }

    pub fn from_operands(operands: OperationOperands, input: Value) -> Self {
        Self {
            name: operands.name,
            behavior: operands.behavior,
            parameters: operands.parameters,
            outcomes: operands.outcomes,
            input,
        }
    }

    pub fn with_behavior(mut self, behavior: impl Into<String>) -> Self {
        self.behavior = Some(behavior.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_outcomes(mut self, outcomes: &[&str]) -> Self {
        self.outcomes = outcomes.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = input.into();
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// First declared outcome, or `default` when the program declared none
    pub fn first_outcome(&self) -> String {
        self.outcomes
            .first()
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }
}

/// Result of a successful invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Selects the successor among the declared outcomes
    pub outcome: String,
    /// Written to the accumulator
    pub value: Value,
}

impl DispatchOutcome {
    pub fn new(outcome: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            outcome: outcome.into(),
            value: value.into(),
        }
    }
}

/// Bridge between the executor and whatever fulfils operations
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn invoke(&self, request: OperationRequest) -> Result<DispatchOutcome, DispatchError>;
}

/// Handler for one family of operations
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, request: &OperationRequest) -> Result<DispatchOutcome, DispatchError>;
}

/// Name-keyed handler table
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn OperationHandler>>>,
    fallback: RwLock<Option<Arc<dyn OperationHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`, replacing any previous one
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        let name = name.into();
        if self.handlers.write().insert(name.clone(), handler).is_some() {
            tracing::debug!("Replaced handler for operation '{}'", name);
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    /// Handler used for names without a registered handler
    pub fn set_fallback(&self, handler: Arc<dyn OperationHandler>) {
        *self.fallback.write() = Some(handler);
    }

    pub fn with_fallback(self, handler: Arc<dyn OperationHandler>) -> Self {
        self.set_fallback(handler);
        self
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn resolve(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers
            .read()
            .get(name)
            .cloned()
            .or_else(|| self.fallback.read().clone())
    }
}

#[async_trait]
impl Dispatcher for HandlerRegistry {
    async fn invoke(&self, request: OperationRequest) -> Result<DispatchOutcome, DispatchError> {
        let handler = self
            .resolve(&request.name)
            .ok_or_else(|| DispatchError::NotRegistered {
                name: request.name.clone(),
            })?;
        tracing::debug!("Dispatching '{}'", request.name);
        handler.handle(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl OperationHandler for Echo {
        async fn handle(&self, request: &OperationRequest) -> Result<DispatchOutcome, DispatchError> {
            Ok(DispatchOutcome::new(request.first_outcome(), request.input.clone()))
        }
    }

    #[tokio::test]
    async fn test_unknown_operation_is_not_registered() {
        let registry = HandlerRegistry::new();
        let err = registry
            .invoke(OperationRequest::new("analyze"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotRegistered { ref name } if name == "analyze"));
    }

    #[tokio::test]
    async fn test_registered_handler_is_used() {
        let registry = HandlerRegistry::new();
        registry.register("analyze", Arc::new(Echo));
        assert!(registry.is_registered("analyze"));

        let outcome = registry
            .invoke(
                OperationRequest::new("analyze")
                    .with_outcomes(&["next", "back"])
                    .with_input("draft"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::new("next", "draft"));
    }

    #[test]
    fn test_invoke_is_runtime_agnostic() {
        let registry = HandlerRegistry::new();
        registry.register("analyze", Arc::new(Echo));

        let outcome = tokio_test::assert_ok!(tokio_test::block_on(
            registry.invoke(OperationRequest::new("analyze").with_input(7i64))
        ));
        assert_eq!(outcome.value, Value::Int(7));
        tokio_test::assert_err!(tokio_test::block_on(registry.invoke(OperationRequest::new("other"))));
    }

    #[tokio::test]
    async fn test_fallback() {
        let registry = HandlerRegistry::new().with_fallback(Arc::new(Echo));
        let outcome = registry
            .invoke(OperationRequest::new("anything"))
            .await
            .unwrap();
        assert_eq!(outcome.outcome, "default");

        assert!(!registry.unregister("anything"));
        assert!(registry.names().is_empty());
    }
}
