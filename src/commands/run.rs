//! `boogie run` subcommand

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use boogie_runtime::{build_vm, init_tracing, load_program, RuntimeConfig, RuntimeError, ScriptedHandler};

pub async fn run(file: &Path, config_path: Option<&Path>, is_bytecode: bool) -> Result<()> {
    let config = RuntimeConfig::load(config_path).map_err(RuntimeError::from)?;
    init_tracing(&config.logging);

    let source = super::read_source(file)?;
    let bytecode = load_program(&source, is_bytecode)
        .with_context(|| format!("failed to load {}", file.display()))?;

    let vm = build_vm(&config, Some(Arc::new(ScriptedHandler::new())));
    let handle = vm.start(bytecode);
    let cancel = handle.cancellation_token();
    let wait = handle.wait();
    tokio::pin!(wait);

    let finished = tokio::select! {
        report = &mut wait => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    let report = match finished {
        Some(report) => report,
        None => {
            tracing::warn!("Interrupted, cancelling run");
            cancel.cancel();
            wait.await
        }
    }
    .map_err(RuntimeError::from)
    .context("run failed")?;

    vm.pool().shutdown();
    println!("run:         {}", report.run_id);
    println!("steps:       {}", report.steps);
    println!("accumulator: {}", report.accumulator.describe());
    println!("memory:      {}", serde_json::to_string_pretty(&report.memory)?);
    Ok(())
}
