//! Operator-facing message and approval types.
//!
//! The approval bus builds a log of `OperatorMessage`s — everything the
//! human operator sees — and matches `ApprovalResponse`s back to blocking
//! asks by timestamp token.

use crate::block::ImageData;
use serde::{Deserialize, Serialize};

/// Kind of a fire-and-forget notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    /// Prose from the model.
    Text,
    /// An error surfaced to the operator.
    Error,
    /// The outcome of an executed tool.
    ToolResult,
    /// A live output line from a running command.
    CommandOutput,
    /// Task lifecycle updates (started, resumed, completed).
    Status,
}

/// Kind of a question posed to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    /// Approve or reject a tool invocation.
    Tool,
    /// Approve or reject a shell command.
    Command,
    /// The model asked the operator a follow-up question.
    Followup,
    /// The model claims the task is complete.
    Completion,
    /// The provider stream failed; retry the turn?
    ResumeAfterError,
}

/// The payload of one operator-visible message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum MessagePayload {
    Notify {
        kind: NotifyKind,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageData>,
        #[serde(default)]
        partial: bool,
    },
    Ask {
        kind: AskKind,
        text: String,
        #[serde(default)]
        partial: bool,
    },
}

impl MessagePayload {
    pub fn is_partial(&self) -> bool {
        match self {
            Self::Notify { partial, .. } | Self::Ask { partial, .. } => *partial,
        }
    }
}

/// One entry of the presenter-visible message log.
///
/// `token` is a strictly increasing epoch-millis timestamp; for asks it is
/// also the key that a response must carry to resolve the wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorMessage {
    pub token: i64,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

/// The operator's answer to a non-partial ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "answer", rename_all = "snake_case")]
pub enum ApprovalResponse {
    /// Go ahead.
    Approved,
    /// Declined, no explanation.
    Denied,
    /// Declined (or redirected) with free-text feedback.
    Feedback {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageData>,
    },
}

impl ApprovalResponse {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}
