//! `boogie compile` subcommand

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn run(file: &Path, json: bool, output: Option<&Path>) -> Result<()> {
    let source = super::read_source(file)?;
    let bytecode =
        dsl::compile_source(&source).with_context(|| format!("failed to compile {}", file.display()))?;

    let rendered = if json {
        bytecode.to_json()?
    } else {
        bytecode.to_string()
    };

    match output {
        Some(path) => {
            fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!("Wrote {} instruction(s) to {}", bytecode.len(), path.display());
        }
        None => println!("{}", rendered.trim_end()),
    }
    Ok(())
}
