//! `coxswain resume` — pick up a checkpointed task.

use std::path::PathBuf;

use coxswain_core::block::TaskId;

use crate::commands::{build_runtime, load_config};
use crate::surface;

pub async fn run(
    config_path: Option<PathBuf>,
    id: String,
    workdir: Option<PathBuf>,
    model: Option<String>,
    allow_reads: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(model) = model {
        config.provider.model = model;
    }
    let runtime = build_runtime(&config, workdir, allow_reads)?;
    surface::spawn(std::sync::Arc::clone(&runtime.bus));

    let abort = runtime.task_loop.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nAborting task...");
            abort.abort();
        }
    });

    let report = runtime.task_loop.resume(TaskId::from(id.as_str())).await?;
    println!(
        "task {} finished: {:?} after {} turn(s)",
        report.task, report.status, report.turns
    );
    Ok(())
}
