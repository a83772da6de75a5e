//! CLI subcommand implementations.

pub mod resume;
pub mod run;
pub mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use coxswain_agent::{TaskLoop, TaskOptions};
use coxswain_bus::ApprovalBus;
use coxswain_config::AppConfig;
use coxswain_history::FileStore;
use coxswain_providers::AnthropicClient;
use coxswain_tools::default_registry;

pub(crate) fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    match path {
        Some(p) => AppConfig::load_from(&p).context("loading config"),
        None => AppConfig::load().context("loading config"),
    }
}

pub(crate) fn tasks_root(config: &AppConfig) -> PathBuf {
    config
        .tasks_dir
        .clone()
        .unwrap_or_else(FileStore::default_root)
}

pub(crate) struct Runtime {
    pub task_loop: TaskLoop,
    pub bus: Arc<ApprovalBus>,
}

/// Wire provider, tools, bus, and storage into a ready task loop.
pub(crate) fn build_runtime(
    config: &AppConfig,
    workdir: Option<PathBuf>,
    allow_reads: bool,
) -> anyhow::Result<Runtime> {
    let workdir = workdir.unwrap_or_else(|| config.effective_workdir());

    let api_key = config.provider.api_key.clone().unwrap_or_default();
    let mut client = AnthropicClient::new(api_key, config.provider.model.clone())?;
    if let Some(base_url) = &config.provider.base_url {
        client = client.with_base_url(base_url.clone());
    }
    if let Some(cw) = config.context_window {
        client = client.with_context_window(cw);
    }

    let bus = Arc::new(ApprovalBus::new());
    let task_loop = TaskLoop::new(
        Arc::new(client),
        Arc::new(default_registry(workdir.clone())),
        Arc::clone(&bus),
        Arc::new(FileStore::new(tasks_root(config))),
        TaskOptions {
            always_allow_read_only: allow_reads || config.always_allow_read_only,
            custom_instructions: config.custom_instructions.clone(),
            context_window: config.context_window,
            workdir,
        },
    );

    Ok(Runtime { task_loop, bus })
}
