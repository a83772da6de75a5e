//! `coxswain run` — start a new task.

use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine;
use coxswain_core::block::ImageData;
use tracing::debug;

use crate::commands::{build_runtime, load_config};
use crate::surface;

pub async fn run(
    config_path: Option<PathBuf>,
    task: String,
    image_paths: Vec<PathBuf>,
    workdir: Option<PathBuf>,
    model: Option<String>,
    allow_reads: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(model) = model {
        config.provider.model = model;
    }
    let images = load_images(&image_paths)?;
    let runtime = build_runtime(&config, workdir, allow_reads)?;
    surface::spawn(std::sync::Arc::clone(&runtime.bus));

    // Ctrl-C requests a clean abort instead of killing the process.
    let abort = runtime.task_loop.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nAborting task...");
            abort.abort();
        }
    });

    let report = runtime.task_loop.start(&task, images).await?;
    println!("task {} finished: {:?} after {} turn(s)", report.task, report.status, report.turns);
    Ok(())
}

fn load_images(paths: &[PathBuf]) -> anyhow::Result<Vec<ImageData>> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading image {}", path.display()))?;
        let media_type = media_type_for(path)
            .with_context(|| format!("unsupported image type: {}", path.display()))?;
        debug!(path = %path.display(), media_type, "Attaching image");
        images.push(ImageData {
            media_type: media_type.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        });
    }
    Ok(images)
}

fn media_type_for(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
