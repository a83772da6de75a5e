//! Persistence trait — checkpointing for durability and resume.
//!
//! Implementations live in `coxswain-history`. The trait receives the full
//! turn-record sequence after every history mutation and the full operator
//! message log after every presenter-visible change; on resume it supplies
//! the last-known record sequence.

use crate::approval::OperatorMessage;
use crate::block::{TaskId, TurnRecord};
use crate::error::PersistError;
use async_trait::async_trait;

/// Checkpoint storage for task state.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Replace the stored history checkpoint for a task.
    async fn save_history(
        &self,
        task: &TaskId,
        records: &[TurnRecord],
    ) -> std::result::Result<(), PersistError>;

    /// Load the last history checkpoint, or `None` for an unknown task.
    async fn load_history(
        &self,
        task: &TaskId,
    ) -> std::result::Result<Option<Vec<TurnRecord>>, PersistError>;

    /// Replace the stored operator-transcript snapshot for a task.
    async fn save_transcript(
        &self,
        task: &TaskId,
        messages: &[OperatorMessage],
    ) -> std::result::Result<(), PersistError>;

    /// Whether any checkpoint exists for this task id.
    async fn task_exists(&self, task: &TaskId) -> std::result::Result<bool, PersistError>;
}
