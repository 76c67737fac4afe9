//! Boogie pipeline language
//!
//! Front end for Boogie programs: source text is lexed into tokens, parsed
//! into an arena AST and compiled into a flat [`Bytecode`] artifact that the
//! runtime executes.
//!
//! ```text
//! out <= (
//!     analyze<temporal> "quantum physics" => next
//!     join <= (reason => ok) (verify => send | back)
//! ) <= in
//! ```

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod parser;

pub use ast::{Ast, Guard, Node, NodeId, NodeKind, Operation};
pub use bytecode::{BranchArm, Bytecode, Instruction, Opcode, OperationOperands, Value};
pub use compiler::{compile, Compiler, RETRY_OUTCOME};
pub use error::{CompileError, DslError, LexError, OperandError, Result, SyntaxError};
pub use lexer::{render, tokenize, Lexer, Token, TokenKind, KEYWORDS};
pub use parser::{parse, Parser};

/// Lex and parse source text
pub fn parse_source(source: &str) -> Result<Ast> {
    let tokens = tokenize(source)?;
    Ok(parse(tokens)?)
}

/// Run the whole front end: lex, parse and compile
pub fn compile_source(source: &str) -> Result<Bytecode> {
    let ast = parse_source(source)?;
    Ok(compile(&ast)?)
}
