//! Interaction tools — tool tags whose "execution" is a conversation with
//! the operator rather than an effect on the world.
//!
//! The presenter routes these by name (`FOLLOWUP_TOOL`, `COMPLETION_TOOL`)
//! to the approval bus instead of dispatching them; the registry entries
//! exist so the parser recognizes their tags, the system prompt documents
//! them, and parameter validation works uniformly.

use async_trait::async_trait;
use coxswain_core::block::ToolParams;
use coxswain_core::error::ToolError;
use coxswain_core::tool::{OutputFeed, Tool, ToolOutcome};

/// `ask_followup_question` — pose a question to the operator and wait for
/// their answer.
pub struct AskFollowupTool;

#[async_trait]
impl Tool for AskFollowupTool {
    fn name(&self) -> &str {
        "ask_followup_question"
    }

    fn description(&self) -> &str {
        "Ask the user a question to gather additional information needed to complete the task."
    }

    fn required_params(&self) -> &[&'static str] {
        &["question"]
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: ToolParams,
        _feed: Option<OutputFeed>,
    ) -> Result<ToolOutcome, ToolError> {
        // Reached only if the presenter's name routing is bypassed.
        let question = params.get("question").cloned().unwrap_or_default();
        Ok(ToolOutcome::text(question))
    }
}

/// `attempt_completion` — present the final result and claim the task is
/// done. Acceptance without feedback ends the task.
pub struct AttemptCompletionTool;

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> &str {
        "attempt_completion"
    }

    fn description(&self) -> &str {
        "Present the result of the task to the user once the work is done. Do not use this until prior tool uses have succeeded."
    }

    fn required_params(&self) -> &[&'static str] {
        &["result"]
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: ToolParams,
        _feed: Option<OutputFeed>,
    ) -> Result<ToolOutcome, ToolError> {
        let result = params.get("result").cloned().unwrap_or_default();
        Ok(ToolOutcome::text(result))
    }
}
