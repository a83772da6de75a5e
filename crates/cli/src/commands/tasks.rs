//! `coxswain tasks` — list checkpointed tasks.

use std::path::PathBuf;

use crate::commands::{load_config, tasks_root};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let root = tasks_root(&config);

    let mut entries = match tokio::fs::read_dir(&root).await {
        Ok(entries) => entries,
        Err(_) => {
            println!("No tasks found in {}", root.display());
            return Ok(());
        }
    };

    let mut found = false;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            found = true;
            println!("{}", entry.file_name().to_string_lossy());
        }
    }
    if !found {
        println!("No tasks found in {}", root.display());
    }
    Ok(())
}
