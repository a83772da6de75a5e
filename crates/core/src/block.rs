//! Content blocks, turn records, and task identity.
//!
//! These are the core value objects that flow through the system:
//! the provider streams raw text → the parser produces `ContentBlock`s →
//! the presenter folds them into the next `TurnRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Aborted,
    Completed,
}

/// A base64-encoded image attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    /// MIME type, e.g. "image/png".
    pub media_type: String,

    /// Base64-encoded payload.
    pub data: String,
}

/// One record of the durable transcript sent to the model.
///
/// Invariant: a history strictly alternates user/assistant starting
/// with user. Enforced by the history manager, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum TurnRecord {
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageData>,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        text: String,
        timestamp: DateTime<Utc>,
    },
}

impl TurnRecord {
    /// Create a user record with no attachments.
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a user record with image attachments.
    pub fn user_with_images(text: impl Into<String>, images: Vec<ImageData>) -> Self {
        Self::User {
            text: text.into(),
            images,
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant record.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    pub fn text(&self) -> &str {
        match self {
            Self::User { text, .. } | Self::Assistant { text, .. } => text,
        }
    }
}

/// Parameter map of a tool-use block. Keys are parameter tag names.
pub type ToolParams = BTreeMap<String, String>;

/// A parsed unit of one assistant turn.
///
/// `partial = true` means the block's closing delimiter has not yet
/// arrived in the stream; such a block may still be rewritten in place
/// as more text arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        content: String,
        partial: bool,
    },
    ToolUse {
        name: String,
        params: ToolParams,
        partial: bool,
    },
}

impl ContentBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } | Self::ToolUse { partial, .. } => *partial,
        }
    }

    /// Clear the partial flag, force-closing the block.
    pub fn close(&mut self) {
        match self {
            Self::Text { partial, .. } | Self::ToolUse { partial, .. } => *partial = false,
        }
    }
}

/// Token usage totals reported by the provider for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
}

impl Usage {
    /// Total tokens counted against the context window.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_writes + self.cache_reads
    }

    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_writes += other.cache_writes;
        self.cache_reads += other.cache_reads;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn record_serialization_roundtrip() {
        let rec = TurnRecord::user("do the thing");
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains(r#""role":"user""#));
        let back: TurnRecord = serde_json::from_str(&json).unwrap();
        assert!(back.is_user());
        assert_eq!(back.text(), "do the thing");
    }

    #[test]
    fn block_close_clears_partial() {
        let mut block = ContentBlock::Text {
            content: "hel".into(),
            partial: true,
        };
        assert!(block.is_partial());
        block.close();
        assert!(!block.is_partial());
    }

    #[test]
    fn usage_totals_and_accumulates() {
        let mut usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_writes: 2,
            cache_reads: 3,
        };
        assert_eq!(usage.total(), 20);
        usage.add(&Usage {
            input_tokens: 1,
            ..Usage::default()
        });
        assert_eq!(usage.total(), 21);
    }
}
