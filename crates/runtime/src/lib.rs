//! Boogie runtime
//!
//! Executes compiled pipeline programs: the [`vm`] interprets bytecode,
//! [`dispatch`] routes operations to handlers and the [`scheduler`] bounds
//! concurrent work, guards send targets with circuit breakers and delivers
//! messages through broadcast groups.

pub mod config;
pub mod dispatch;
pub mod logging;
pub mod scheduler;
pub mod types;
pub mod vm;

pub use config::RuntimeConfig;
pub use dispatch::{
    register_builtins, DispatchOutcome, Dispatcher, HandlerRegistry, OperationHandler, OperationRequest,
    ScriptedHandler,
};
pub use logging::{init_tracing, LogFormat, LoggingConfig};
pub use scheduler::{
    BroadcastGroup, CircuitBreakerConfig, ScheduleOptions, ScheduledHandle, SchedulerConfig, SchedulingPool,
    Subscription,
};
pub use types::*;
pub use vm::{RunHandle, RunReport, Vm, VmConfig};

use std::sync::Arc;

use dsl::Bytecode;

/// A VM wired to the built-in handlers and a fresh scheduling pool
///
/// Operations without a registered handler go to `fallback` when given.
pub fn build_vm(config: &RuntimeConfig, fallback: Option<Arc<dyn OperationHandler>>) -> Vm {
    let pool = Arc::new(SchedulingPool::new(
        config.scheduler.clone(),
        config.circuit_breaker.clone(),
    ));
    let registry = HandlerRegistry::new();
    register_builtins(&registry, pool.clone());
    if let Some(fallback) = fallback {
        registry.set_fallback(fallback);
    }
    Vm::new(Arc::new(registry), pool, config.vm.clone())
}

/// Compile program source, or load a JSON bytecode artifact when `is_bytecode`
pub fn load_program(source: &str, is_bytecode: bool) -> Result<Bytecode, RuntimeError> {
    let bytecode = if is_bytecode {
        Bytecode::from_json(source)?
    } else {
        dsl::compile_source(source)?
    };
    tracing::debug!("Loaded program with {} instruction(s)", bytecode.len());
    Ok(bytecode)
}
