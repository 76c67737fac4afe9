//! `boogie parse` subcommand

use anyhow::{Context, Result};
use std::path::Path;

pub fn run(file: &Path) -> Result<()> {
    let source = super::read_source(file)?;
    let ast = dsl::parse_source(&source).with_context(|| format!("failed to parse {}", file.display()))?;
    print!("{}", ast.outline());
    Ok(())
}
