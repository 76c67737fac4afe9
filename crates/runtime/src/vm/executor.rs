//! Instruction interpreter
//!
//! A run starts one stream at the bytecode entry. JOIN fans out one stream
//! per branch on a [`JoinSet`] and suspends the joining stream until every
//! branch has halted. All streams of a run share its [`Registers`].

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use dsl::{Bytecode, Instruction, Opcode, OperandError, OperationOperands, Value};

use super::state::{Registers, Stream, Transition};
use super::{RunReport, VmConfig};
use crate::dispatch::{DispatchOutcome, Dispatcher, OperationRequest};
use crate::scheduler::{ScheduleOptions, SchedulingPool, Subscription};
use crate::types::{DispatchError, RunId, SchedulerError, VmError};

type Inbox = Arc<tokio::sync::Mutex<Subscription>>;

/// Everything one program run owns
pub(crate) struct Run {
    id: RunId,
    bytecode: Arc<Bytecode>,
    registers: Mutex<Registers>,
    dispatcher: Arc<dyn Dispatcher>,
    pool: Arc<SchedulingPool>,
    config: VmConfig,
    cancel: CancellationToken,
    steps: AtomicUsize,
    inboxes: Mutex<HashMap<String, Inbox>>,
}

impl Run {
    pub(crate) fn new(
        id: RunId,
        bytecode: Arc<Bytecode>,
        dispatcher: Arc<dyn Dispatcher>,
        pool: Arc<SchedulingPool>,
        config: VmConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            bytecode,
            registers: Mutex::new(Registers::new()),
            dispatcher,
            pool,
            config,
            cancel,
            steps: AtomicUsize::new(0),
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    fn report(&self) -> RunReport {
        let (accumulator, memory) = self.registers.lock().clone().into_parts();
        RunReport {
            run_id: self.id,
            accumulator,
            memory,
            steps: self.steps.load(Ordering::SeqCst),
        }
    }

    /// Subscribe to every group a RECEIVE reads before any SEND runs
    fn open_inboxes(&self) -> Result<(), VmError> {
        for (pc, instruction) in self.bytecode.instructions.iter().enumerate() {
            if instruction.opcode != Opcode::Receive {
                continue;
            }
            if let Ok(group) = instruction.str_operand(0, "broadcast group") {
                self.inbox(pc, group)?;
            }
        }
        Ok(())
    }

    fn inbox(&self, pc: usize, group: &str) -> Result<Inbox, VmError> {
        let mut inboxes = self.inboxes.lock();
        if let Some(inbox) = inboxes.get(group) {
            return Ok(inbox.clone());
        }

        let receive_error = |source| VmError::Receive {
            pc,
            group: group.to_string(),
            source,
        };
        self.pool
            .create_broadcast_group(group, self.pool.config().group_ttl)
            .map_err(receive_error)?;
        let subscription = self.pool.subscribe(group).map_err(receive_error)?;
        let inbox = Arc::new(tokio::sync::Mutex::new(subscription));
        inboxes.insert(group.to_string(), inbox.clone());
        Ok(inbox)
    }

    async fn step(self: &Arc<Self>, stream: &mut Stream) -> Result<Transition, VmError> {
        let pc = stream.pc();
        let len = self.bytecode.len();

        let steps = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if steps > self.config.max_steps {
            return Err(VmError::StepLimit {
                pc,
                limit: self.config.max_steps,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(VmError::Cancelled { pc });
        }

        let instruction = self
            .bytecode
            .get(pc)
            .ok_or(VmError::InvalidEntry { entry: pc, len })?;
        tracing::debug!("[{}] {:>4}  {}", self.id, pc, instruction);

        let opcode = instruction.opcode;
        match opcode {
            Opcode::Nop => self.fall_through(pc, instruction),
            Opcode::Return => Ok(Transition::Halt),
            Opcode::Store => {
                let key = instruction
                    .str_operand(0, "memory key")
                    .map_err(operand_error(pc, opcode))?;
                let value = instruction
                    .operand(1, "value")
                    .map_err(operand_error(pc, opcode))?;
                self.registers.lock().store(key, value.clone());
                self.fall_through(pc, instruction)
            }
            Opcode::Load => {
                let key = instruction
                    .str_operand(0, "memory key")
                    .map_err(operand_error(pc, opcode))?;
                self.registers.lock().load(key);
                self.fall_through(pc, instruction)
            }
            Opcode::Jump => {
                let target = instruction
                    .index_operand(0, "jump target")
                    .map_err(operand_error(pc, opcode))?;
                self.goto(pc, opcode, target)
            }
            Opcode::Branch => {
                let arms = instruction
                    .branch_arms()
                    .map_err(operand_error(pc, opcode))?;
                let taken = {
                    let registers = self.registers.lock();
                    arms.iter().find(|arm| registers.matches(&arm.guard)).map(|arm| arm.target)
                };
                match taken {
                    Some(target) => self.goto(pc, opcode, target),
                    None => self.fall_through(pc, instruction),
                }
            }
            Opcode::Spawn => self.spawn_operation(pc, instruction).await,
            Opcode::Call => self.call_operation(pc, instruction).await,
            Opcode::Join => self.join(pc, instruction, stream).await,
            Opcode::Send => self.send(pc, instruction).await,
            Opcode::Receive => self.receive(pc, instruction).await,
        }
    }

    fn goto(&self, pc: usize, opcode: Opcode, target: usize) -> Result<Transition, VmError> {
        let len = self.bytecode.len();
        if target >= len {
            return Err(VmError::OutOfBounds {
                pc,
                opcode,
                target,
                len,
            });
        }
        Ok(Transition::Goto(target))
    }

    fn fall_through(&self, pc: usize, instruction: &Instruction) -> Result<Transition, VmError> {
        match instruction.next_targets.first() {
            Some(&target) => self.goto(pc, instruction.opcode, target),
            None => Ok(Transition::Halt),
        }
    }

    async fn spawn_operation(&self, pc: usize, instruction: &Instruction) -> Result<Transition, VmError> {
        let operation = instruction
            .operation()
            .map_err(operand_error(pc, Opcode::Spawn))?;
        let name = operation.name.clone();
        let declared = operation.outcomes.clone();

        let result = self.dispatch(pc, Opcode::Spawn, operation).await?;
        let selected = select_outcome(pc, &name, &declared, &result.outcome)?;
        tracing::debug!("[{}] '{}' resolved to '{}'", self.id, name, result.outcome);

        {
            let mut registers = self.registers.lock();
            registers.set_accumulator(result.value.clone());
            registers.store(name, result.value);
        }

        match selected {
            Some(index) if instruction.next_targets.len() == declared.len() => {
                self.goto(pc, Opcode::Spawn, instruction.next_targets[index])
            }
            _ => self.fall_through(pc, instruction),
        }
    }

    async fn call_operation(&self, pc: usize, instruction: &Instruction) -> Result<Transition, VmError> {
        let operation = instruction
            .operation()
            .map_err(operand_error(pc, Opcode::Call))?;
        let result = self.dispatch(pc, Opcode::Call, operation).await?;
        self.registers.lock().set_accumulator(result.value);
        self.fall_through(pc, instruction)
    }

    /// Invoke the dispatcher, bounded by the operation timeout and the run's cancellation
    ///
    /// SPAWN runs the invocation on its own task; CALL runs it on the current stream.
    async fn dispatch(
        &self,
        pc: usize,
        opcode: Opcode,
        operation: OperationOperands,
    ) -> Result<DispatchOutcome, VmError> {
        let name = operation.name.clone();
        let input = self.registers.lock().accumulator().clone();
        let request = OperationRequest::from_operands(operation, input);
        let limit = self.config.operation_timeout;
        let timed_out = || VmError::Timeout {
            pc,
            opcode,
            name: name.clone(),
            timeout: limit,
        };

        let result = if opcode == Opcode::Spawn {
            let dispatcher = self.dispatcher.clone();
            let mut task = tokio::spawn(async move { dispatcher.invoke(request).await });
            let joined = tokio::select! {
                _ = self.cancel.cancelled() => None,
                joined = tokio::time::timeout(limit, &mut task) => Some(joined),
            };
            match joined {
                None => {
                    task.abort();
                    return Err(VmError::Cancelled { pc });
                }
                Some(Err(_)) => {
                    task.abort();
                    return Err(timed_out());
                }
                Some(Ok(Err(join_error))) => Err(DispatchError::Failed {
                    name: name.clone(),
                    reason: join_error.to_string(),
                }),
                Some(Ok(Ok(result))) => result,
            }
        } else {
            let invoked = tokio::select! {
                _ = self.cancel.cancelled() => return Err(VmError::Cancelled { pc }),
                invoked = tokio::time::timeout(limit, self.dispatcher.invoke(request)) => invoked,
            };
            invoked.map_err(|_| timed_out())?
        };

        result.map_err(|source| match source {
            DispatchError::NotRegistered { name } => VmError::UnregisteredOperation { pc, opcode, name },
            DispatchError::Scheduler(SchedulerError::Cancelled { .. }) => VmError::Cancelled { pc },
            source => VmError::Dispatch {
                pc,
                opcode,
                name: name.clone(),
                source,
            },
        })
    }

    async fn join(
        self: &Arc<Self>,
        pc: usize,
        instruction: &Instruction,
        stream: &mut Stream,
    ) -> Result<Transition, VmError> {
        let entries = instruction
            .join_entries()
            .map_err(operand_error(pc, Opcode::Join))?;
        let len = self.bytecode.len();
        if let Some(&target) = entries.iter().find(|&&entry| entry >= len) {
            return Err(VmError::OutOfBounds {
                pc,
                opcode: Opcode::Join,
                target,
                len,
            });
        }

        stream.await_join(entries.len());
        tracing::debug!("[{}] JOIN at {} over {} branch(es)", self.id, pc, entries.len());

        let mut branches = JoinSet::new();
        for (branch, &entry) in entries.iter().enumerate() {
            let run = self.clone();
            branches.spawn(async move { (branch, entry, run_stream(run, entry).await) });
        }

        let mut first_error = None;
        while let Some(joined) = branches.join_next().await {
            let error = match joined {
                Ok((_, _, Ok(()))) => continue,
                Ok((branch, entry, Err(source))) => {
                    tracing::warn!(
                        "[{}] JOIN at {}: branch {} (entry {}) failed: {}",
                        self.id,
                        pc,
                        branch,
                        entry,
                        source
                    );
                    VmError::JoinFailed {
                        pc,
                        branch,
                        entry,
                        source: Box::new(source),
                    }
                }
                Err(join_error) => {
                    tracing::warn!("[{}] JOIN at {}: branch task died: {}", self.id, pc, join_error);
                    VmError::Aborted {
                        reason: format!("branch of JOIN at instruction {} died: {}", pc, join_error),
                    }
                }
            };
            first_error.get_or_insert(error);
        }

        stream.resume();
        match first_error {
            Some(error) => Err(error),
            None => self.fall_through(pc, instruction),
        }
    }

    async fn send(&self, pc: usize, instruction: &Instruction) -> Result<Transition, VmError> {
        let target = instruction
            .str_operand(0, "target agent")
            .map_err(operand_error(pc, Opcode::Send))?;
        let payload = match instruction.operands.get(1) {
            Some(payload) => payload.clone(),
            None => self.registers.lock().accumulator().clone(),
        };

        let options = ScheduleOptions::new().with_cancellation(self.cancel.child_token());
        match self.pool.send_with(target, payload, options).await {
            Ok(_) => self.fall_through(pc, instruction),
            Err(SchedulerError::Cancelled { .. }) => Err(VmError::Cancelled { pc }),
            Err(source) => Err(VmError::Send {
                pc,
                target: target.to_string(),
                source,
            }),
        }
    }

    async fn receive(&self, pc: usize, instruction: &Instruction) -> Result<Transition, VmError> {
        let group = instruction
            .str_operand(0, "broadcast group")
            .map_err(operand_error(pc, Opcode::Receive))?;
        let inbox = self.inbox(pc, group)?;
        let limit = self.pool.config().scheduling_timeout;

        let received = tokio::select! {
            _ = self.cancel.cancelled() => return Err(VmError::Cancelled { pc }),
            received = async {
                let mut subscription = inbox.lock().await;
                tokio::time::timeout(limit, subscription.recv()).await
            } => received,
        };

        let value: Value = match received {
            Ok(Ok(value)) => value,
            Ok(Err(source)) => {
                return Err(VmError::Receive {
                    pc,
                    group: group.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(VmError::Receive {
                    pc,
                    group: group.to_string(),
                    source: SchedulerError::ReceiveTimeout {
                        group: group.to_string(),
                        timeout: limit,
                    },
                })
            }
        };
        self.registers.lock().set_accumulator(value);
        self.fall_through(pc, instruction)
    }
}

fn operand_error(pc: usize, opcode: Opcode) -> impl FnOnce(OperandError) -> VmError {
    move |source| VmError::Operand { pc, opcode, source }
}

/// Index of the declared outcome `outcome` selects, `None` when nothing was declared
fn select_outcome(
    pc: usize,
    name: &str,
    declared: &[String],
    outcome: &str,
) -> Result<Option<usize>, VmError> {
    if declared.is_empty() {
        return Ok(None);
    }
    declared
        .iter()
        .position(|o| o == outcome)
        .or_else(|| declared.iter().position(|o| o == "default"))
        .map(Some)
        .ok_or_else(|| VmError::UndeclaredOutcome {
            pc,
            name: name.to_string(),
            outcome: outcome.to_string(),
            declared: declared.join(", "),
        })
}

/// Drive one stream from `entry` until it halts
fn run_stream(run: Arc<Run>, entry: usize) -> BoxFuture<'static, Result<(), VmError>> {
    async move {
        let mut stream = Stream::new(entry);
        while stream.is_running() {
            match run.step(&mut stream).await {
                Ok(transition) => stream.advance(transition),
                Err(error) => {
                    stream.fail(error.to_string());
                    return Err(error);
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Execute a prepared run to completion
pub(crate) async fn execute(run: Arc<Run>) -> Result<RunReport, VmError> {
    let len = run.bytecode.len();
    tracing::info!("Starting run {} ({} instructions)", run.id, len);

    let result = match run.bytecode.entry {
        None => Ok(()),
        Some(entry) if entry >= len => Err(VmError::InvalidEntry { entry, len }),
        Some(entry) => match run.open_inboxes() {
            Ok(()) => run_stream(run.clone(), entry).await,
            Err(error) => Err(error),
        },
    };

    match result {
        Ok(()) => {
            let report = run.report();
            tracing::info!("Run {} finished after {} step(s)", run.id, report.steps);
            Ok(report)
        }
        Err(error) => {
            tracing::info!("Run {} failed: {}", run.id, error);
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_outcome() {
        let declared = vec!["send".to_string(), "back".to_string()];
        assert_eq!(select_outcome(0, "verify", &declared, "back").unwrap(), Some(1));
        assert_eq!(select_outcome(0, "verify", &[], "anything").unwrap(), None);

        let err = select_outcome(3, "verify", &declared, "reject").unwrap_err();
        assert!(matches!(err, VmError::UndeclaredOutcome { pc: 3, .. }));
        assert!(err.to_string().contains("send, back"));
    }

    #[test]
    fn test_default_outcome_catches_unknown() {
        let declared = vec!["next".to_string(), "default".to_string()];
        assert_eq!(select_outcome(0, "reason", &declared, "other").unwrap(), Some(1));
    }
}
