//! Error taxonomy for the Boogie front end
//!
//! Lexical, syntax and compilation failures are kept as separate types so a
//! caller can tell malformed input apart from a compiler bug.

use thiserror::Error;

/// Errors raised while scanning source text
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("malformed operator '{found}' at line {line}, column {column}: '{lead}' must be followed by {expected}")]
    MalformedOperator {
        lead: char,
        found: String,
        expected: &'static str,
        line: usize,
        column: usize,
    },

    #[error("unterminated literal starting at line {line}, column {column}")]
    UnterminatedLiteral { line: usize, column: usize },

    #[error("unterminated behavior starting at line {line}, column {column}")]
    UnterminatedBehavior { line: usize, column: usize },

    #[error("unexpected character '{ch}' at line {line}, column {column}")]
    UnexpectedCharacter { ch: char, line: usize, column: usize },
}

/// Errors raised while building the AST
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("expected {expected}, found {found} at line {line}, column {column}")]
    Unexpected {
        expected: String,
        found: String,
        line: usize,
        column: usize,
    },

    #[error("unexpected end of input: expected {expected}")]
    UnexpectedEof { expected: String },

    #[error("unbalanced ')' at line {line}, column {column}")]
    UnbalancedClose { line: usize, column: usize },

    #[error("{open} unclosed closure(s) at end of input")]
    UnclosedClosure { open: usize },

    #[error("join at line {line}, column {column} has no branches")]
    EmptyJoin { line: usize, column: usize },

    #[error("match at line {line}, column {column} has no arms")]
    EmptyMatch { line: usize, column: usize },

    #[error("operation '{name}' at line {line}, column {column} declares no outcome")]
    MissingOutcome {
        name: String,
        line: usize,
        column: usize,
    },
}

/// Internal compiler invariant violations
///
/// None of these are reachable for an AST produced by [`crate::Parser`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unexpected {kind} node #{node} in statement position")]
    UnexpectedNode { node: usize, kind: &'static str },

    #[error("malformed {kind} node #{node}: {reason}")]
    MalformedNode {
        node: usize,
        kind: &'static str,
        reason: String,
    },

    #[error("label L{label} was never bound to an instruction")]
    UnresolvedLabel { label: usize },

    #[error("label L{label} is part of an alias cycle")]
    LabelCycle { label: usize },

    #[error("instruction {index} references {target}, but only {len} instructions were emitted")]
    DanglingReference {
        index: usize,
        target: usize,
        len: usize,
    },
}

/// Operand decoding failures for a single instruction
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperandError {
    #[error("missing operand {position} ({expected})")]
    Missing {
        position: usize,
        expected: &'static str,
    },

    #[error("operand {position} should be {expected}, found {found}")]
    Invalid {
        position: usize,
        expected: &'static str,
        found: String,
    },
}

/// Aggregate error for the whole `source -> bytecode` pipeline
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DslError {
    #[error("lexical error: {0}")]
    Lex(#[from] LexError),

    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("internal compiler error: {0}")]
    Compile(#[from] CompileError),

    #[error("invalid bytecode: {0}")]
    Bytecode(String),
}

impl From<serde_json::Error> for DslError {
    fn from(error: serde_json::Error) -> Self {
        DslError::Bytecode(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DslError>;
