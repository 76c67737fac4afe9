//! `boogie` subcommands

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub mod compile;
pub mod parse;
pub mod run;
pub mod tokens;

pub(crate) fn read_source(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))
}
