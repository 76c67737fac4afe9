//! Bytecode virtual machine
//!
//! [`Vm`] executes compiled programs against a [`Dispatcher`] and a shared
//! [`SchedulingPool`]. Each run gets its own registers; the pool's circuit
//! breakers are the only state runs share.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dsl::{Bytecode, Value};

use crate::dispatch::Dispatcher;
use crate::scheduler::SchedulingPool;
use crate::types::{RunId, VmError};

pub mod executor;
pub mod state;

pub use state::{Registers, Stream, StreamState, Transition};

use executor::Run;

/// Executor limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Instructions one run may execute across all of its streams
    pub max_steps: usize,
    /// Upper bound on a single SPAWN or CALL dispatch
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            operation_timeout: Duration::from_secs(300),
        }
    }
}

/// Final state of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: RunId,
    pub accumulator: Value,
    pub memory: BTreeMap<String, Value>,
    /// Instructions executed, summed over all streams
    pub steps: usize,
}

/// A run executing in the background
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunReport, VmError>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Cancel every stream, dispatch and send of this run
    pub fn cancel(&self) {
        tracing::info!("Cancelling run {}", self.id);
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<RunReport, VmError> {
        self.task.await.map_err(|e| VmError::Aborted {
            reason: e.to_string(),
        })?
    }
}

/// Program executor
#[derive(Clone)]
pub struct Vm {
    dispatcher: Arc<dyn Dispatcher>,
    pool: Arc<SchedulingPool>,
    config: VmConfig,
}

impl Vm {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, pool: Arc<SchedulingPool>, config: VmConfig) -> Self {
        Self {
            dispatcher,
            pool,
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SchedulingPool> {
        &self.pool
    }

    /// Run `bytecode` to completion on the current task
    pub async fn execute(&self, bytecode: &Bytecode) -> Result<RunReport, VmError> {
        let run = self.prepare(RunId::new(), Arc::new(bytecode.clone()), CancellationToken::new());
        executor::execute(run).await
    }

    /// Run `bytecode` on a new task
    pub fn start(&self, bytecode: Bytecode) -> RunHandle {
        let id = RunId::new();
        let cancel = CancellationToken::new();
        let run = self.prepare(id, Arc::new(bytecode), cancel.clone());
        RunHandle {
            id,
            cancel,
            task: tokio::spawn(executor::execute(run)),
        }
    }

    fn prepare(&self, id: RunId, bytecode: Arc<Bytecode>, cancel: CancellationToken) -> Arc<Run> {
        Arc::new(Run::new(
            id,
            bytecode,
            self.dispatcher.clone(),
            self.pool.clone(),
            self.config.clone(),
            cancel,
        ))
    }
}
