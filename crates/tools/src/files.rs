//! File tools — read, write, and list within the working directory.

use crate::resolve_within;
use async_trait::async_trait;
use coxswain_core::block::ToolParams;
use coxswain_core::error::ToolError;
use coxswain_core::tool::{OutputFeed, Tool, ToolOutcome};
use std::path::PathBuf;
use tracing::debug;

/// Read a file and return its contents.
pub struct ReadFileTool {
    workdir: PathBuf,
}

impl ReadFileTool {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path, relative to the working directory."
    }

    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: ToolParams,
        _feed: Option<OutputFeed>,
    ) -> Result<ToolOutcome, ToolError> {
        let path = params
            .get("path")
            .ok_or_else(|| ToolError::InvalidParams("missing 'path'".into()))?;

        let resolved = match resolve_within(&self.workdir, path) {
            Ok(p) => p,
            Err(reason) => return Ok(ToolOutcome::error(reason)),
        };

        debug!(path = %resolved.display(), "Reading file");
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => Ok(ToolOutcome::text(content)),
            Err(e) => Ok(ToolOutcome::error(format!(
                "Failed to read {path}: {e}"
            ))),
        }
    }
}

/// Write (create or overwrite) a file.
pub struct WriteToFileTool {
    workdir: PathBuf,
}

impl WriteToFileTool {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl Tool for WriteToFileTool {
    fn name(&self) -> &str {
        "write_to_file"
    }

    fn description(&self) -> &str {
        "Write content to a file at the given path. Creates the file if it doesn't exist, overwrites if it does."
    }

    fn required_params(&self) -> &[&'static str] {
        &["path", "content"]
    }

    async fn execute(
        &self,
        params: ToolParams,
        _feed: Option<OutputFeed>,
    ) -> Result<ToolOutcome, ToolError> {
        let path = params
            .get("path")
            .ok_or_else(|| ToolError::InvalidParams("missing 'path'".into()))?;
        let content = params
            .get("content")
            .ok_or_else(|| ToolError::InvalidParams("missing 'content'".into()))?;

        let resolved = match resolve_within(&self.workdir, path) {
            Ok(p) => p,
            Err(reason) => return Ok(ToolOutcome::error(reason)),
        };

        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolOutcome::error(format!(
                    "Failed to create directory for {path}: {e}"
                )));
            }
        }

        debug!(path = %resolved.display(), bytes = content.len(), "Writing file");
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(ToolOutcome::text(format!(
                "Successfully wrote {} bytes to {path}",
                content.len()
            ))),
            Err(e) => Ok(ToolOutcome::error(format!(
                "Failed to write {path}: {e}"
            ))),
        }
    }
}

/// List directory entries.
pub struct ListFilesTool {
    workdir: PathBuf,
}

impl ListFilesTool {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List the entries of a directory at the given path. Directories are suffixed with '/'."
    }

    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: ToolParams,
        _feed: Option<OutputFeed>,
    ) -> Result<ToolOutcome, ToolError> {
        let path = params
            .get("path")
            .ok_or_else(|| ToolError::InvalidParams("missing 'path'".into()))?;

        let resolved = match resolve_within(&self.workdir, path) {
            Ok(p) => p,
            Err(reason) => return Ok(ToolOutcome::error(reason)),
        };

        let mut reader = match tokio::fs::read_dir(&resolved).await {
            Ok(r) => r,
            Err(e) => {
                return Ok(ToolOutcome::error(format!("Failed to list {path}: {e}")))
            }
        };

        let mut entries = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    entries.push(if is_dir { format!("{name}/") } else { name });
                }
                Ok(None) => break,
                Err(e) => {
                    return Ok(ToolOutcome::error(format!("Failed to list {path}: {e}")))
                }
            }
        }
        entries.sort_unstable();

        if entries.is_empty() {
            Ok(ToolOutcome::text(format!("{path} is empty")))
        } else {
            Ok(ToolOutcome::text(entries.join("\n")))
        }
    }
}
