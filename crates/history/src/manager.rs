//! The history manager: alternation-enforcing append and token-budget
//! truncation.

use coxswain_core::block::{TaskId, TurnRecord, Usage};
use coxswain_core::error::{Error, HistoryError, Result};
use coxswain_core::persist::Persistence;
use std::sync::Arc;
use tracing::{debug, info};

/// Tokens reserved below the context window before truncation triggers.
const CONTEXT_HEADROOM: u64 = 40_000;

/// Owns one task's transcript. Records strictly alternate user/assistant
/// starting with user; the manager rejects appends that would break that.
pub struct HistoryManager {
    task: TaskId,
    records: Vec<TurnRecord>,
    store: Arc<dyn Persistence>,
}

impl HistoryManager {
    /// An empty history for a fresh task.
    pub fn new(task: TaskId, store: Arc<dyn Persistence>) -> Self {
        Self {
            task,
            records: Vec::new(),
            store,
        }
    }

    /// Reconstruct a history from a persisted checkpoint (task resume).
    pub fn from_records(
        task: TaskId,
        records: Vec<TurnRecord>,
        store: Arc<dyn Persistence>,
    ) -> Result<Self> {
        for (i, record) in records.iter().enumerate() {
            let expect_user = i % 2 == 0;
            if record.is_user() != expect_user {
                return Err(HistoryError::BrokenAlternation {
                    expected: if expect_user { "user" } else { "assistant" },
                }
                .into());
            }
        }
        Ok(Self {
            task,
            records,
            store,
        })
    }

    pub fn records(&self) -> &[TurnRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one record, enforcing alternation, and checkpoint.
    pub async fn append(&mut self, record: TurnRecord) -> Result<()> {
        let expect_user = self.records.len() % 2 == 0;
        if record.is_user() != expect_user {
            return Err(HistoryError::BrokenAlternation {
                expected: if expect_user { "user" } else { "assistant" },
            }
            .into());
        }

        self.records.push(record);
        self.store.save_history(&self.task, &self.records).await?;
        debug!(task = %self.task, records = self.records.len(), "History appended");
        Ok(())
    }

    /// Truncate the oldest half of the non-initial turn pairs when the
    /// turn's token usage approaches the context window.
    ///
    /// Threshold: `max(context_window - 40_000, context_window * 4 / 5)`.
    /// The very first user record is always preserved to keep the task
    /// framing, and an even record count is removed starting at index 1 so
    /// alternation stays intact. Persist-then-swap: a persistence failure
    /// leaves the history unchanged.
    ///
    /// Returns whether a truncation happened.
    pub async fn truncate_if_over_budget(
        &mut self,
        usage: &Usage,
        context_window: u64,
    ) -> Result<bool> {
        let threshold = context_window
            .saturating_sub(CONTEXT_HEADROOM)
            .max(context_window * 4 / 5);
        if usage.total() < threshold {
            return Ok(false);
        }

        let len = self.records.len();
        let mut remove = (len.saturating_sub(1)) / 2;
        remove -= remove % 2;
        if remove == 0 {
            // Never truncate below one user/assistant pair.
            return Ok(false);
        }

        let mut truncated = Vec::with_capacity(len - remove);
        truncated.push(self.records[0].clone());
        truncated.extend_from_slice(&self.records[1 + remove..]);

        self.store
            .save_history(&self.task, &truncated)
            .await
            .map_err(|e| Error::History(HistoryError::TruncatePersist(e.to_string())))?;

        info!(
            task = %self.task,
            removed = remove,
            remaining = truncated.len(),
            total_tokens = usage.total(),
            "History truncated to fit context window"
        );
        self.records = truncated;
        Ok(true)
    }
}
