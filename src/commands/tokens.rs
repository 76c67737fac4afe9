//! `boogie tokens` subcommand

use anyhow::{Context, Result};
use std::path::Path;

pub fn run(file: &Path) -> Result<()> {
    let source = super::read_source(file)?;
    for token in dsl::Lexer::new(&source) {
        let token = token.with_context(|| format!("failed to lex {}", file.display()))?;
        println!(
            "{:>4}:{:<3} {:<10} {:?}",
            token.line,
            token.column,
            format!("{:?}", token.kind),
            token.text
        );
    }
    Ok(())
}
