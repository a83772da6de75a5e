//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world:
//! read and write files, run commands, ask the operator a question.
//! Exactly one tool may execute per turn; the presenter enforces that,
//! the registry only dispatches.

use crate::block::{ImageData, ToolParams};
use crate::error::ToolError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Live output lines from a long-running tool (e.g. a subprocess).
///
/// A tool's own streaming is a separate concern from turn-level streaming:
/// lines sent here are forwarded to the operator by a side task and never
/// re-enter the presenter state machine.
pub type OutputFeed = mpsc::UnboundedSender<String>;

/// The result of invoking a tool, folded into the turn result so the
/// model can react to it on the next provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Response payload text (or error description).
    pub text: String,

    /// Attached images, if the tool produced any.
    pub images: Vec<ImageData>,

    /// Whether the payload describes a failure.
    pub is_error: bool,

    /// Distinguishes "tool failed" from "human declined".
    pub user_rejected: bool,
}

impl ToolOutcome {
    /// A successful text outcome.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
            is_error: false,
            user_rejected: false,
        }
    }

    /// An error outcome (tool ran and failed, or could not run).
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
            is_error: true,
            user_rejected: false,
        }
    }

    /// An outcome recording that the human declined the invocation.
    pub fn rejected(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
            is_error: false,
            user_rejected: true,
        }
    }

    /// Attach images to this outcome.
    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }
}

/// The core Tool trait.
///
/// Each tool (write_to_file, execute_command, attempt_completion, ...)
/// implements this trait and is registered in the `ToolRegistry`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool — also its tag name in model output.
    fn name(&self) -> &str;

    /// What this tool does, rendered into the system prompt.
    fn description(&self) -> &str;

    /// Parameter names that must be present for execution.
    fn required_params(&self) -> &[&'static str];

    /// Whether this tool only observes and never mutates; read-only tools
    /// may skip the approval gate when the operator opted in.
    fn read_only(&self) -> bool {
        false
    }

    /// Return the first missing required parameter, if any.
    fn validate(&self, params: &ToolParams) -> Option<&'static str> {
        self.required_params()
            .iter()
            .find(|p| !params.contains_key(**p))
            .copied()
    }

    /// Execute the tool. `feed`, when present, receives live output lines.
    async fn execute(
        &self,
        params: ToolParams,
        feed: Option<OutputFeed>,
    ) -> std::result::Result<ToolOutcome, ToolError>;

    /// Release any open resource this tool holds (terminal handles,
    /// sessions). Invoked by the task loop on abort.
    async fn teardown(&self) {}
}

/// A registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// All registered tool names, sorted for stable prompt rendering.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Dispatch an invocation to the named tool.
    pub async fn dispatch(
        &self,
        name: &str,
        params: ToolParams,
        feed: Option<OutputFeed>,
    ) -> std::result::Result<ToolOutcome, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(params, feed).await
    }

    /// Invoke teardown on every registered tool.
    pub async fn teardown_all(&self) {
        for tool in self.tools.values() {
            tool.teardown().await;
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
