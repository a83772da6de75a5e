//! Command execution tool — runs a shell command in the working directory
//! and streams output lines live while it runs.

use async_trait::async_trait;
use coxswain_core::block::ToolParams;
use coxswain_core::error::ToolError;
use coxswain_core::tool::{OutputFeed, Tool, ToolOutcome};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Execute a shell command.
///
/// Output lines are pushed to the live feed as they arrive — that feed is
/// forwarded to the operator by a side task and never touches the turn
/// state machine — and the full output is returned in the outcome.
pub struct ExecuteCommandTool {
    workdir: PathBuf,
}

impl ExecuteCommandTool {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory and return its combined output."
    }

    fn required_params(&self) -> &[&'static str] {
        &["command"]
    }

    async fn execute(
        &self,
        params: ToolParams,
        feed: Option<OutputFeed>,
    ) -> Result<ToolOutcome, ToolError> {
        let command = params
            .get("command")
            .ok_or_else(|| ToolError::InvalidParams("missing 'command'".into()))?;

        debug!(command = %command, "Executing command");

        let mut child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "execute_command".into(),
                reason: e.to_string(),
            })?;

        // Drain both pipes concurrently so neither can fill and stall the
        // child, feeding lines out live as they arrive.
        let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let mut lines = Vec::new();
        while let Some(line) = line_rx.recv().await {
            if let Some(feed) = &feed {
                let _ = feed.send(line.clone());
            }
            lines.push(line);
        }

        let status = child.wait().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "execute_command".into(),
            reason: e.to_string(),
        })?;

        let output = lines.join("\n");
        if status.success() {
            Ok(ToolOutcome::text(if output.is_empty() {
                "Command completed with no output".to_string()
            } else {
                output
            }))
        } else {
            let code = status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            Ok(ToolOutcome::error(format!(
                "Command exited with code {code}:\n{output}"
            )))
        }
    }
}
