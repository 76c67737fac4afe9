//! Bytecode artifact shared by the compiler and the executor
//!
//! A [`Bytecode`] is a dense, zero-indexed list of [`Instruction`]s. Each
//! instruction carries untyped [`Value`] operands and the indices of its
//! control-flow successors. The JSON form produced by [`Bytecode::to_json`]
//! preserves instruction order and operand types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ast::Guard;
use crate::error::{DslError, OperandError, Result};

/// Untyped runtime value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    /// `Empty`, `false`, `0`, `""` and `[]` are falsy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Empty => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            Value::Int(n) => usize::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Operand rendering: strings quoted, empty shown as `-`
    pub fn describe(&self) -> String {
        match self {
            Value::Empty => "-".to_string(),
            Value::Str(s) => format!("{:?}", s),
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(Value::describe).collect();
                format!("[{}]", items.join(", "))
            }
            other => other.to_string(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Nop,
    Spawn,
    Call,
    Join,
    Store,
    Load,
    Branch,
    Jump,
    Send,
    Receive,
    Return,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Nop => "NOP",
            Opcode::Spawn => "SPAWN",
            Opcode::Call => "CALL",
            Opcode::Join => "JOIN",
            Opcode::Store => "STORE",
            Opcode::Load => "LOAD",
            Opcode::Branch => "BRANCH",
            Opcode::Jump => "JUMP",
            Opcode::Send => "SEND",
            Opcode::Receive => "RECEIVE",
            Opcode::Return => "RETURN",
        };
        f.pad(name)
    }
}

/// Decoded operands of a SPAWN or CALL
///
/// Encoded positionally as `[name, behavior, outcomes, parameters]`. Only
/// the name is required; missing trailing slots decode as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationOperands {
    pub name: String,
    pub behavior: Option<String>,
    pub outcomes: Vec<String>,
    pub parameters: BTreeMap<String, String>,
}

impl OperationOperands {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Vec<Value> {
        vec![
            Value::from(self.name.as_str()),
            self.behavior
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Empty),
            Value::List(self.outcomes.iter().map(|o| Value::from(o.as_str())).collect()),
            Value::List(
                self.parameters
                    .iter()
                    .map(|(k, v)| Value::List(vec![Value::from(k.as_str()), Value::from(v.as_str())]))
                    .collect(),
            ),
        ]
    }

    pub fn decode(operands: &[Value]) -> std::result::Result<Self, OperandError> {
        let name = match operands.first() {
            Some(Value::Str(name)) => name.clone(),
            Some(other) => return Err(invalid(0, "operation name", other)),
            None => {
                return Err(OperandError::Missing {
                    position: 0,
                    expected: "operation name",
                })
            }
        };

        let behavior = match operands.get(1) {
            None | Some(Value::Empty) => None,
            Some(Value::Str(b)) => Some(b.clone()),
            Some(other) => return Err(invalid(1, "behavior", other)),
        };

        let mut outcomes = Vec::new();
        match operands.get(2) {
            None | Some(Value::Empty) => {}
            Some(Value::List(items)) => {
                for item in items {
                    match item {
                        Value::Str(o) => outcomes.push(o.clone()),
                        other => return Err(invalid(2, "list of outcome names", other)),
                    }
                }
            }
            Some(other) => return Err(invalid(2, "list of outcome names", other)),
        }

        let mut parameters = BTreeMap::new();
        match operands.get(3) {
            None | Some(Value::Empty) => {}
            Some(Value::List(pairs)) => {
                for pair in pairs {
                    match pair.as_list() {
                        Some([Value::Str(k), Value::Str(v)]) => {
                            parameters.insert(k.clone(), v.clone());
                        }
                        _ => return Err(invalid(3, "list of [key, value] pairs", pair)),
                    }
                }
            }
            Some(other) => return Err(invalid(3, "list of [key, value] pairs", other)),
        }

        Ok(Self {
            name,
            behavior,
            outcomes,
            parameters,
        })
    }
}

/// One `(guard, target)` pair of a BRANCH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchArm {
    pub guard: Guard,
    pub target: usize,
}

impl BranchArm {
    pub fn new(guard: Guard, target: usize) -> Self {
        Self { guard, target }
    }

    /// `[kind, argument, target]`
    pub fn encode(&self) -> Value {
        let (kind, argument) = match &self.guard {
            Guard::Default => ("default", Value::Empty),
            Guard::Ok => ("ok", Value::Empty),
            Guard::Equals(text) => ("equals", Value::from(text.as_str())),
            Guard::Memory(key) => ("memory", Value::from(key.as_str())),
        };
        Value::List(vec![Value::from(kind), argument, Value::from(self.target)])
    }

    pub fn decode(position: usize, value: &Value) -> std::result::Result<Self, OperandError> {
        const EXPECTED: &str = "[guard kind, argument, target] arm";

        let Some([Value::Str(kind), argument, target]) = value.as_list() else {
            return Err(invalid(position, EXPECTED, value));
        };
        let guard = match (kind.as_str(), argument) {
            ("default", _) => Guard::Default,
            ("ok", _) => Guard::Ok,
            ("equals", Value::Str(text)) => Guard::Equals(text.clone()),
            ("memory", Value::Str(key)) => Guard::Memory(key.clone()),
            _ => return Err(invalid(position, EXPECTED, value)),
        };
        let target = target
            .as_index()
            .ok_or_else(|| invalid(position, EXPECTED, value))?;
        Ok(Self { guard, target })
    }
}

fn invalid(position: usize, expected: &'static str, found: &Value) -> OperandError {
    OperandError::Invalid {
        position,
        expected,
        found: format!("{} {}", found.type_name(), found.describe()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    #[serde(default)]
    pub operands: Vec<Value>,
    #[serde(default)]
    pub next_targets: Vec<usize>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<Value>) -> Self {
        Self {
            opcode,
            operands,
            next_targets: Vec::new(),
        }
    }

    pub fn with_next(mut self, next_targets: Vec<usize>) -> Self {
        self.next_targets = next_targets;
        self
    }

    pub fn nop() -> Self {
        Self::new(Opcode::Nop, Vec::new())
    }

    pub fn spawn(operation: &OperationOperands) -> Self {
        Self::new(Opcode::Spawn, operation.encode())
    }

    pub fn call(operation: &OperationOperands) -> Self {
        Self::new(Opcode::Call, operation.encode())
    }

    pub fn join(entries: &[usize]) -> Self {
        Self::new(Opcode::Join, entries.iter().map(|e| Value::from(*e)).collect())
    }

    pub fn store(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(Opcode::Store, vec![Value::Str(key.into()), value.into()])
    }

    pub fn load(key: impl Into<String>) -> Self {
        Self::new(Opcode::Load, vec![Value::Str(key.into())])
    }

    pub fn branch(arms: &[BranchArm]) -> Self {
        Self::new(Opcode::Branch, arms.iter().map(BranchArm::encode).collect())
    }

    pub fn jump(target: usize) -> Self {
        Self::new(Opcode::Jump, vec![Value::from(target)])
    }

    /// Without a payload the executor sends the accumulator
    pub fn send(target: impl Into<String>, payload: Option<Value>) -> Self {
        let mut operands = vec![Value::Str(target.into())];
        operands.extend(payload);
        Self::new(Opcode::Send, operands)
    }

    pub fn receive(group: impl Into<String>) -> Self {
        Self::new(Opcode::Receive, vec![Value::Str(group.into())])
    }

    pub fn ret() -> Self {
        Self::new(Opcode::Return, Vec::new())
    }

    pub fn operand(&self, position: usize, expected: &'static str) -> std::result::Result<&Value, OperandError> {
        self.operands
            .get(position)
            .ok_or(OperandError::Missing { position, expected })
    }

    pub fn str_operand(&self, position: usize, expected: &'static str) -> std::result::Result<&str, OperandError> {
        let value = self.operand(position, expected)?;
        value.as_str().ok_or_else(|| invalid(position, expected, value))
    }

    pub fn index_operand(&self, position: usize, expected: &'static str) -> std::result::Result<usize, OperandError> {
        let value = self.operand(position, expected)?;
        value.as_index().ok_or_else(|| invalid(position, expected, value))
    }

    pub fn operation(&self) -> std::result::Result<OperationOperands, OperandError> {
        OperationOperands::decode(&self.operands)
    }

    /// Branch entries of a JOIN; at least one is required
    pub fn join_entries(&self) -> std::result::Result<Vec<usize>, OperandError> {
        self.operand(0, "branch entry index")?;
        (0..self.operands.len())
            .map(|i| self.index_operand(i, "branch entry index"))
            .collect()
    }

    pub fn branch_arms(&self) -> std::result::Result<Vec<BranchArm>, OperandError> {
        self.operands
            .iter()
            .enumerate()
            .map(|(i, v)| BranchArm::decode(i, v))
            .collect()
    }

    /// Indices this instruction references through its operands
    fn operand_targets(&self) -> Vec<usize> {
        match self.opcode {
            Opcode::Jump => self.index_operand(0, "jump target").into_iter().collect(),
            Opcode::Join => self.join_entries().unwrap_or_default(),
            Opcode::Branch => self
                .branch_arms()
                .map(|arms| arms.into_iter().map(|a| a.target).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<8}", self.opcode)?;
        let operands: Vec<String> = self.operands.iter().map(Value::describe).collect();
        if !operands.is_empty() {
            write!(f, " {}", operands.join(" "))?;
        }
        if !self.next_targets.is_empty() {
            let next: Vec<String> = self.next_targets.iter().map(|n| n.to_string()).collect();
            write!(f, " -> {}", next.join(", "))?;
        }
        Ok(())
    }
}

/// Compiled program
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bytecode {
    /// First instruction of the top-level stream; `None` halts immediately
    pub entry: Option<usize>,
    pub instructions: Vec<Instruction>,
}

impl Bytecode {
    pub fn new(entry: Option<usize>, instructions: Vec<Instruction>) -> Self {
        Self {
            entry,
            instructions,
        }
    }

    /// Link hand-assembled instructions in order
    ///
    /// Every instruction without explicit successors falls through to the
    /// next index, except JUMP and RETURN.
    pub fn sequential(mut instructions: Vec<Instruction>) -> Self {
        let len = instructions.len();
        for (index, instruction) in instructions.iter_mut().enumerate() {
            let falls_through = !matches!(instruction.opcode, Opcode::Jump | Opcode::Return);
            if falls_through && instruction.next_targets.is_empty() && index + 1 < len {
                instruction.next_targets.push(index + 1);
            }
        }
        Self {
            entry: if len == 0 { None } else { Some(0) },
            instructions,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    /// Check that the entry and every successor or operand target is in bounds
    pub fn validate(&self) -> Result<()> {
        let len = self.instructions.len();
        if let Some(entry) = self.entry {
            if entry >= len {
                return Err(DslError::Bytecode(format!(
                    "entry {} is out of bounds for {} instructions",
                    entry, len
                )));
            }
        }

        for (index, instruction) in self.instructions.iter().enumerate() {
            let targets = instruction
                .next_targets
                .iter()
                .copied()
                .chain(instruction.operand_targets());
            for target in targets {
                if target >= len {
                    return Err(DslError::Bytecode(format!(
                        "instruction {} ({}) targets {}, which is out of bounds for {} instructions",
                        index, instruction.opcode, target, len
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a persisted artifact
    pub fn from_json(json: &str) -> Result<Self> {
        let bytecode: Bytecode = serde_json::from_str(json)?;
        bytecode.validate()?;
        Ok(bytecode)
    }
}

impl fmt::Display for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entry {
            Some(entry) => writeln!(f, "entry: {}", entry)?,
            None => writeln!(f, "entry: none")?,
        }
        for (index, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "{:>4}  {}", index, instruction)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Empty.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::from("v").is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
    }

    #[test]
    fn test_sequential_links_fallthrough() {
        let bytecode = Bytecode::sequential(vec![
            Instruction::store("k", "v"),
            Instruction::jump(3),
            Instruction::load("k"),
            Instruction::ret(),
        ]);

        assert_eq!(bytecode.entry, Some(0));
        assert_eq!(bytecode.instructions[0].next_targets, vec![1]);
        assert!(bytecode.instructions[1].next_targets.is_empty());
        assert_eq!(bytecode.instructions[2].next_targets, vec![3]);
        assert!(bytecode.instructions[3].next_targets.is_empty());
        assert!(Bytecode::sequential(vec![]).entry.is_none());
    }

    #[test]
    fn test_operation_operands_decode_partial() {
        let instruction = Instruction::new(Opcode::Spawn, vec![Value::from("analyze")]);
        let operation = instruction.operation().unwrap();
        assert_eq!(operation, OperationOperands::new("analyze"));

        let missing = Instruction::new(Opcode::Spawn, vec![]).operation().unwrap_err();
        assert!(matches!(missing, OperandError::Missing { position: 0, .. }));

        let wrong = Instruction::new(Opcode::Spawn, vec![Value::Int(3)]).operation().unwrap_err();
        assert!(matches!(wrong, OperandError::Invalid { position: 0, .. }));
    }

    #[test]
    fn test_operation_operands_encode() {
        let mut operation = OperationOperands::new("call");
        operation.behavior = Some("browser".into());
        operation.outcomes = vec!["send".into(), "back".into()];
        operation.parameters.insert("to".into(), "reviewer".into());

        let decoded = OperationOperands::decode(&operation.encode()).unwrap();
        assert_eq!(decoded, operation);
    }

    #[test]
    fn test_branch_arms() {
        let arms = vec![
            BranchArm::new(Guard::Equals("approved".into()), 4),
            BranchArm::new(Guard::Memory("verify".into()), 6),
            BranchArm::new(Guard::Default, 7),
        ];
        let instruction = Instruction::branch(&arms);
        assert_eq!(instruction.branch_arms().unwrap(), arms);

        let bad = Instruction::new(Opcode::Branch, vec![Value::from("ok")]);
        assert!(bad.branch_arms().is_err());
    }

    #[test]
    fn test_join_requires_entries() {
        assert_eq!(Instruction::join(&[0, 4]).join_entries().unwrap(), vec![0, 4]);
        assert!(matches!(
            Instruction::join(&[]).join_entries(),
            Err(OperandError::Missing { position: 0, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_bounds() {
        let bytecode = Bytecode::sequential(vec![Instruction::jump(999)]);
        let err = bytecode.validate().unwrap_err();
        assert!(err.to_string().contains("out of bounds"));

        let mut bytecode = Bytecode::sequential(vec![Instruction::nop()]);
        bytecode.instructions[0].next_targets = vec![1];
        assert!(bytecode.validate().is_err());

        let bytecode = Bytecode::new(Some(2), vec![Instruction::nop()]);
        assert!(bytecode.validate().is_err());
    }

    #[test]
    fn test_json_preserves_operand_types() {
        let bytecode = Bytecode::sequential(vec![
            Instruction::store("count", Value::Int(3)),
            Instruction::store("flag", Value::Bool(true)),
            Instruction::store("name", "3"),
            Instruction::load("count"),
        ]);

        let json = bytecode.to_json().unwrap();
        let restored = Bytecode::from_json(&json).unwrap();
        assert_eq!(restored, bytecode);
        assert_eq!(restored.instructions[0].operands[1], Value::Int(3));
        assert_eq!(restored.instructions[2].operands[1], Value::from("3"));
    }

    #[test]
    fn test_from_json_validates() {
        let json = r#"{"entry":0,"instructions":[{"opcode":"JUMP","operands":[{"int":5}]}]}"#;
        assert!(matches!(Bytecode::from_json(json), Err(DslError::Bytecode(_))));
        assert!(Bytecode::from_json("not json").is_err());
    }

    #[test]
    fn test_listing() {
        let bytecode = Bytecode::sequential(vec![Instruction::store("k", "v"), Instruction::load("k")]);
        let listing = bytecode.to_string();
        assert!(listing.starts_with("entry: 0\n"));
        assert!(listing.contains("   0  STORE    \"k\" \"v\" -> 1"));
        assert!(listing.contains("   1  LOAD     \"k\""));
    }
}
