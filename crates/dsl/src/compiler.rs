//! AST to bytecode compiler
//!
//! Statements are emitted in source order. Successor edges that point at
//! code not yet emitted are recorded against symbolic labels and resolved
//! once the whole program has been walked, so every stored index is final.
//!
//! Layout rules:
//! - an operation is one SPAWN followed by one SPAWN per outcome; the
//!   operation's successors are its outcome instructions, and each outcome
//!   continues with the statement successor (`back` re-enters the operation)
//! - a join emits its branches first and the JOIN instruction last; the JOIN
//!   is the statement's entry point
//! - a match emits its arms first and the BRANCH instruction last; an arm
//!   rejoins the statement successor when it finishes
//! - the end of the program is an empty successor list, which halts

use tracing::debug;

use crate::ast::{Ast, Guard, NodeId, NodeKind, Operation};
use crate::bytecode::{BranchArm, Bytecode, Instruction, Opcode, OperationOperands, Value};
use crate::error::CompileError;

type CompileResult<T> = std::result::Result<T, CompileError>;

/// Outcome whose successor is the operation that declared it
pub const RETRY_OUTCOME: &str = "back";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum LabelTarget {
    Unbound,
    Index(usize),
    Alias(Label),
    Halt,
}

#[derive(Debug, Clone)]
enum Operand {
    Value(Value),
    Entry(Label),
    Arm(Guard, Label),
}

#[derive(Debug)]
struct Pending {
    opcode: Opcode,
    operands: Vec<Operand>,
    next: Vec<Label>,
}

/// Single-use compiler over one AST
pub struct Compiler<'a> {
    ast: &'a Ast,
    pending: Vec<Pending>,
    labels: Vec<LabelTarget>,
}

impl<'a> Compiler<'a> {
    pub fn new(ast: &'a Ast) -> Self {
        Self {
            ast,
            pending: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn compile(mut self) -> CompileResult<Bytecode> {
        let root = self.ast.root();
        let closure = match self.ast.children(root) {
            [closure] if matches!(self.ast.kind(*closure), Some(NodeKind::Closure)) => *closure,
            children => {
                return Err(CompileError::MalformedNode {
                    node: root.0,
                    kind: "program",
                    reason: format!("expected one closure, found {} children", children.len()),
                })
            }
        };

        let halt = self.label(LabelTarget::Halt);
        let entry = self.compile_closure(closure, halt)?;
        let entry = self.resolve(entry)?;

        let instructions = self.finish()?;
        debug!("compiled {} instruction(s), entry {:?}", instructions.len(), entry);
        Ok(Bytecode::new(entry, instructions))
    }

    /// Compile statements in order; returns the label of the closure's entry
    fn compile_closure(&mut self, closure: NodeId, successor: Label) -> CompileResult<Label> {
        let statements = self.ast.children(closure).to_vec();
        if statements.is_empty() {
            return Ok(successor);
        }

        let entries: Vec<Label> = statements
            .iter()
            .map(|_| self.label(LabelTarget::Unbound))
            .collect();

        for (i, statement) in statements.iter().enumerate() {
            let next = entries.get(i + 1).copied().unwrap_or(successor);
            let entry = self.compile_statement(*statement, next)?;
            self.bind(entries[i], LabelTarget::Alias(entry));
        }

        Ok(entries[0])
    }

    fn compile_statement(&mut self, node: NodeId, successor: Label) -> CompileResult<Label> {
        let ast = self.ast;
        match ast.kind(node) {
            Some(NodeKind::Operation(operation)) => {
                self.compile_operation(node, operation, successor)
            }
            Some(NodeKind::Join) => self.compile_join(node, successor),
            Some(NodeKind::Match { guards }) => {
                self.compile_match(node, guards.clone(), successor)
            }
            Some(other) => Err(CompileError::UnexpectedNode {
                node: node.0,
                kind: other.name(),
            }),
            None => Err(CompileError::MalformedNode {
                node: node.0,
                kind: "unknown",
                reason: "node does not exist".to_string(),
            }),
        }
    }

    fn compile_operation(
        &mut self,
        node: NodeId,
        operation: &Operation,
        successor: Label,
    ) -> CompileResult<Label> {
        let mut outcomes = Vec::new();
        for child in self.ast.children(node) {
            match self.ast.kind(*child) {
                Some(NodeKind::Outcome(label)) => outcomes.push(label.clone()),
                _ => {
                    return Err(CompileError::MalformedNode {
                        node: node.0,
                        kind: "operation",
                        reason: format!("child #{} is not an outcome", child.0),
                    })
                }
            }
        }
        if outcomes.is_empty() {
            return Err(CompileError::MalformedNode {
                node: node.0,
                kind: "operation",
                reason: "no outcomes declared".to_string(),
            });
        }

        let spawn = OperationOperands {
            name: operation.name.clone(),
            behavior: operation.behavior.clone(),
            outcomes: outcomes.clone(),
            parameters: operation.parameters.clone(),
        };
        let entry = self.emit(Opcode::Spawn, values(spawn.encode()), Vec::new());

        let mut targets = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let next = if outcome == RETRY_OUTCOME {
                entry
            } else {
                successor
            };
            let operands = values(OperationOperands::new(outcome).encode());
            targets.push(self.emit(Opcode::Spawn, operands, vec![next]));
        }
        self.set_next(entry, targets);

        Ok(entry)
    }

    fn compile_join(&mut self, node: NodeId, successor: Label) -> CompileResult<Label> {
        let branches = self.ast.children(node).to_vec();
        if branches.is_empty() {
            return Err(CompileError::MalformedNode {
                node: node.0,
                kind: "join",
                reason: "no branches".to_string(),
            });
        }

        let mut entries = Vec::with_capacity(branches.len());
        for branch in branches {
            let halt = self.label(LabelTarget::Halt);
            entries.push(Operand::Entry(self.compile_arm(branch, halt)?));
        }

        Ok(self.emit(Opcode::Join, entries, vec![successor]))
    }

    fn compile_match(
        &mut self,
        node: NodeId,
        guards: Vec<Guard>,
        successor: Label,
    ) -> CompileResult<Label> {
        let arms = self.ast.children(node).to_vec();
        if arms.is_empty() || arms.len() != guards.len() {
            return Err(CompileError::MalformedNode {
                node: node.0,
                kind: "match",
                reason: format!("{} guard(s) for {} arm(s)", guards.len(), arms.len()),
            });
        }

        let mut operands = Vec::with_capacity(arms.len());
        for (guard, arm) in guards.into_iter().zip(arms) {
            let entry = self.compile_arm(arm, successor)?;
            operands.push(Operand::Arm(guard, entry));
        }

        Ok(self.emit(Opcode::Branch, operands, vec![successor]))
    }

    /// Join branches and match arms always get a concrete entry, a NOP if empty
    fn compile_arm(&mut self, closure: NodeId, successor: Label) -> CompileResult<Label> {
        if !matches!(self.ast.kind(closure), Some(NodeKind::Closure)) {
            return Err(CompileError::UnexpectedNode {
                node: closure.0,
                kind: self.ast.kind(closure).map(|k| k.name()).unwrap_or("unknown"),
            });
        }
        if self.ast.children(closure).is_empty() {
            return Ok(self.emit(Opcode::Nop, Vec::new(), vec![successor]));
        }
        self.compile_closure(closure, successor)
    }

    fn label(&mut self, target: LabelTarget) -> Label {
        self.labels.push(target);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label, target: LabelTarget) {
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = target;
        }
    }

    /// Append an instruction and return a label bound to its index
    fn emit(&mut self, opcode: Opcode, operands: Vec<Operand>, next: Vec<Label>) -> Label {
        self.pending.push(Pending {
            opcode,
            operands,
            next,
        });
        self.label(LabelTarget::Index(self.pending.len() - 1))
    }

    fn set_next(&mut self, label: Label, next: Vec<Label>) {
        if let Some(LabelTarget::Index(index)) = self.labels.get(label.0).copied() {
            if let Some(pending) = self.pending.get_mut(index) {
                pending.next = next;
            }
        }
    }

    /// Follow aliases to an index; `None` means halt
    fn resolve(&self, label: Label) -> CompileResult<Option<usize>> {
        let mut current = label;
        for _ in 0..=self.labels.len() {
            match self.labels.get(current.0) {
                Some(LabelTarget::Index(index)) => return Ok(Some(*index)),
                Some(LabelTarget::Halt) => return Ok(None),
                Some(LabelTarget::Alias(next)) => current = *next,
                Some(LabelTarget::Unbound) | None => {
                    return Err(CompileError::UnresolvedLabel { label: current.0 })
                }
            }
        }
        Err(CompileError::LabelCycle { label: label.0 })
    }

    fn resolve_entry(&self, label: Label) -> CompileResult<usize> {
        self.resolve(label)?
            .ok_or(CompileError::UnresolvedLabel { label: label.0 })
    }

    fn finish(&self) -> CompileResult<Vec<Instruction>> {
        let len = self.pending.len();
        let mut instructions = Vec::with_capacity(len);

        for pending in &self.pending {
            let mut operands = Vec::with_capacity(pending.operands.len());
            for operand in &pending.operands {
                operands.push(match operand {
                    Operand::Value(value) => value.clone(),
                    Operand::Entry(label) => Value::from(self.resolve_entry(*label)?),
                    Operand::Arm(guard, label) => {
                        BranchArm::new(guard.clone(), self.resolve_entry(*label)?).encode()
                    }
                });
            }

            let mut next_targets = Vec::with_capacity(pending.next.len());
            for label in &pending.next {
                if let Some(target) = self.resolve(*label)? {
                    next_targets.push(target);
                }
            }

            let instruction = Instruction::new(pending.opcode, operands).with_next(next_targets);
            instructions.push(instruction);
        }

        let bytecode = Bytecode::new(None, instructions);
        for (index, instruction) in bytecode.instructions.iter().enumerate() {
            let referenced = instruction.next_targets.iter().copied().chain(
                match instruction.opcode {
                    Opcode::Join => instruction.join_entries().unwrap_or_default(),
                    Opcode::Branch => instruction
                        .branch_arms()
                        .map(|arms| arms.into_iter().map(|a| a.target).collect())
                        .unwrap_or_default(),
                    _ => Vec::new(),
                },
            );
            for target in referenced {
                if target >= len {
                    return Err(CompileError::DanglingReference { index, target, len });
                }
            }
        }

        Ok(bytecode.instructions)
    }
}

fn values(values: Vec<Value>) -> Vec<Operand> {
    values.into_iter().map(Operand::Value).collect()
}

/// Compile a parsed program
pub fn compile(ast: &Ast) -> CompileResult<Bytecode> {
    Compiler::new(ast).compile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn compile_source(source: &str) -> Bytecode {
        let ast = parse(tokenize(source).unwrap()).unwrap();
        compile(&ast).unwrap()
    }

    fn spawn_name(instruction: &Instruction) -> String {
        assert_eq!(instruction.opcode, Opcode::Spawn);
        instruction.operation().unwrap().name
    }

    #[test]
    fn test_empty_program() {
        let bytecode = compile_source("out <= () <= in");
        assert!(bytecode.is_empty());
        assert_eq!(bytecode.entry, None);
    }

    #[test]
    fn test_operation_and_outcome() {
        let bytecode = compile_source("out <= (analyze => send) <= in");
        assert_eq!(bytecode.len(), 2);
        assert_eq!(spawn_name(&bytecode.instructions[0]), "analyze");
        assert_eq!(spawn_name(&bytecode.instructions[1]), "send");

        assert_eq!(bytecode.entry, Some(0));
        assert_eq!(bytecode.instructions[0].next_targets, vec![1]);
        assert!(bytecode.instructions[1].next_targets.is_empty());
        assert_eq!(
            bytecode.instructions[0].operation().unwrap().outcomes,
            vec!["send".to_string()]
        );
    }

    #[test]
    fn test_sequential_statements_chain() {
        let bytecode = compile_source("out <= (analyze => next verify => send | back) <= in");
        let names: Vec<String> = bytecode.instructions.iter().map(spawn_name).collect();
        assert_eq!(names, vec!["analyze", "next", "verify", "send", "back"]);

        // next -> verify
        assert_eq!(bytecode.instructions[1].next_targets, vec![2]);
        assert_eq!(bytecode.instructions[2].next_targets, vec![3, 4]);
        assert!(bytecode.instructions[3].next_targets.is_empty());
        // back -> verify
        assert_eq!(bytecode.instructions[4].next_targets, vec![2]);
    }

    #[test]
    fn test_two_branch_join() {
        let source = r#"
            out <= (
                join <= (
                    analyze => next
                    verify  => send
                ) (
                    analyze => next
                    verify  => send
                )
            ) <= in"#;
        let bytecode = compile_source(source);

        assert_eq!(bytecode.len(), 9);
        let spawns = bytecode
            .instructions
            .iter()
            .filter(|i| i.opcode == Opcode::Spawn)
            .count();
        assert_eq!(spawns, 8);

        let join = &bytecode.instructions[8];
        assert_eq!(join.opcode, Opcode::Join);
        assert_eq!(join.operands.len(), 2);
        assert_eq!(join.join_entries().unwrap(), vec![0, 4]);
        assert!(join.next_targets.is_empty());
        assert_eq!(bytecode.entry, Some(8));

        // each branch halts at its end
        assert!(bytecode.instructions[3].next_targets.is_empty());
        assert!(bytecode.instructions[7].next_targets.is_empty());
    }

    #[test]
    fn test_join_successor() {
        let bytecode = compile_source("out <= (join <= (a => ok) (b => ok) c => ok) <= in");
        let join = bytecode
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::Join)
            .unwrap();
        let after = bytecode.instructions[join].next_targets[0];
        assert_eq!(spawn_name(&bytecode.instructions[after]), "c");
    }

    #[test]
    fn test_empty_join_branch_is_nop() {
        let bytecode = compile_source("out <= (join <= () (a => ok)) <= in");
        assert_eq!(bytecode.instructions[0].opcode, Opcode::Nop);
        assert!(bytecode.instructions[0].next_targets.is_empty());
        let join = bytecode.instructions.last().unwrap();
        assert_eq!(join.join_entries().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_match_compiles_to_branch() {
        let source = r#"out <= (
            verify => ok
            match <= "approved" (send => ok) default (cancel => ok)
            next => ok
        ) <= in"#;
        let bytecode = compile_source(source);

        let branch_index = bytecode
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::Branch)
            .unwrap();
        let branch = &bytecode.instructions[branch_index];
        let arms = branch.branch_arms().unwrap();
        assert_eq!(arms.len(), 2);
        assert_eq!(arms[0].guard, Guard::Equals("approved".into()));
        assert_eq!(spawn_name(&bytecode.instructions[arms[0].target]), "send");
        assert_eq!(spawn_name(&bytecode.instructions[arms[1].target]), "cancel");

        // the ok after verify enters the match
        assert_eq!(bytecode.instructions[1].next_targets, vec![branch_index]);

        // fallthrough and arm ends continue with `next`
        let after = branch.next_targets[0];
        assert_eq!(spawn_name(&bytecode.instructions[after]), "next");
        let send_ok = arms[0].target + 1;
        assert_eq!(bytecode.instructions[send_ok].next_targets, vec![after]);
    }

    #[test]
    fn test_parameters_carried() {
        let bytecode = compile_source(r#"out <= (call<browser> "quantum" => ok) <= in"#);
        let operation = bytecode.instructions[0].operation().unwrap();
        assert_eq!(operation.behavior.as_deref(), Some("browser"));
        assert_eq!(operation.parameters.get("arg0").map(String::as_str), Some("quantum"));
    }

    #[test]
    fn test_deterministic() {
        let source = "out <= (join <= (a => ok | back) (b => next) match <= ok (c => ok)) <= in";
        assert_eq!(compile_source(source), compile_source(source));
    }

    #[test]
    fn test_rejects_malformed_ast() {
        let ast = Ast::new();
        assert!(matches!(
            compile(&ast),
            Err(CompileError::MalformedNode { kind: "program", .. })
        ));

        let mut ast = Ast::new();
        let closure = ast.add_child(ast.root(), NodeKind::Closure, 1, 1);
        ast.add_child(closure, NodeKind::Outcome("ok".into()), 1, 2);
        assert!(matches!(
            compile(&ast),
            Err(CompileError::UnexpectedNode { kind: "outcome", .. })
        ));

        let mut ast = Ast::new();
        let closure = ast.add_child(ast.root(), NodeKind::Closure, 1, 1);
        ast.add_child(closure, NodeKind::Operation(Operation::new("a")), 1, 2);
        assert!(matches!(
            compile(&ast),
            Err(CompileError::MalformedNode { kind: "operation", .. })
        ));
    }

    #[test]
    fn test_all_references_in_bounds() {
        let source = r#"out <= (
            join <= (join <= (a => ok) ()) (b => back | ok)
            match <= flag (c => ok) "x" () default (d => next)
        ) <= in"#;
        let bytecode = compile_source(source);
        assert!(bytecode.validate().is_ok());
    }
}
