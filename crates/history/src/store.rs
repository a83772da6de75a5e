//! Checkpoint stores — JSONL persistence and a test no-op.
//!
//! `FileStore` writes one JSON object per line, under
//! `<root>/<task-id>/history.jsonl` and `<root>/<task-id>/transcript.jsonl`.
//! Writes go to a temp file first and are renamed into place, so a crash
//! mid-write never corrupts the last good checkpoint.

use async_trait::async_trait;
use coxswain_core::approval::OperatorMessage;
use coxswain_core::block::{TaskId, TurnRecord};
use coxswain_core::error::PersistError;
use coxswain_core::persist::Persistence;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// JSONL-file-backed checkpoint store.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: `~/.coxswain/tasks`.
    pub fn default_root() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".coxswain").join("tasks")
    }

    fn task_dir(&self, task: &TaskId) -> PathBuf {
        self.root.join(&task.0)
    }

    fn history_path(&self, task: &TaskId) -> PathBuf {
        self.task_dir(task).join("history.jsonl")
    }

    fn transcript_path(&self, task: &TaskId) -> PathBuf {
        self.task_dir(task).join("transcript.jsonl")
    }

    /// Serialize items as JSONL and rename into place.
    async fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), PersistError> {
        let mut body = String::new();
        for item in items {
            let line = serde_json::to_string(item)
                .map_err(|e| PersistError::Storage(e.to_string()))?;
            body.push_str(&line);
            body.push('\n');
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistError::Storage(e.to_string()))?;
        }

        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| PersistError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| PersistError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Read a JSONL file back. A malformed line is a hard error: a
    /// checkpoint with holes would silently break history alternation.
    async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>, PersistError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistError::Storage(e.to_string())),
        };

        let mut items = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let item = serde_json::from_str(line).map_err(|e| {
                PersistError::Corrupted(format!("{}: line {}: {e}", path.display(), n + 1))
            })?;
            items.push(item);
        }
        Ok(Some(items))
    }
}

#[async_trait]
impl Persistence for FileStore {
    async fn save_history(
        &self,
        task: &TaskId,
        records: &[TurnRecord],
    ) -> Result<(), PersistError> {
        let path = self.history_path(task);
        Self::write_jsonl(&path, records).await?;
        debug!(task = %task, records = records.len(), "History checkpoint saved");
        Ok(())
    }

    async fn load_history(
        &self,
        task: &TaskId,
    ) -> Result<Option<Vec<TurnRecord>>, PersistError> {
        Self::read_jsonl(&self.history_path(task)).await
    }

    async fn save_transcript(
        &self,
        task: &TaskId,
        messages: &[OperatorMessage],
    ) -> Result<(), PersistError> {
        Self::write_jsonl(&self.transcript_path(task), messages).await
    }

    async fn task_exists(&self, task: &TaskId) -> Result<bool, PersistError> {
        Ok(tokio::fs::try_exists(self.history_path(task))
            .await
            .unwrap_or(false))
    }
}

/// A store that remembers nothing. Used by tests and dry runs.
pub struct NoopStore;

#[async_trait]
impl Persistence for NoopStore {
    async fn save_history(
        &self,
        _task: &TaskId,
        _records: &[TurnRecord],
    ) -> Result<(), PersistError> {
        Ok(())
    }

    async fn load_history(
        &self,
        _task: &TaskId,
    ) -> Result<Option<Vec<TurnRecord>>, PersistError> {
        Ok(None)
    }

    async fn save_transcript(
        &self,
        _task: &TaskId,
        _messages: &[OperatorMessage],
    ) -> Result<(), PersistError> {
        Ok(())
    }

    async fn task_exists(&self, _task: &TaskId) -> Result<bool, PersistError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_load_history_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let task = TaskId::new();

        let records = vec![
            TurnRecord::user("start the task"),
            TurnRecord::assistant("on it"),
        ];
        store.save_history(&task, &records).await.unwrap();
        assert!(store.task_exists(&task).await.unwrap());

        let loaded = store.load_history(&task).await.unwrap().unwrap();
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn load_unknown_task_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let task = TaskId::new();
        assert!(store.load_history(&task).await.unwrap().is_none());
        assert!(!store.task_exists(&task).await.unwrap());
    }

    #[tokio::test]
    async fn corrupted_line_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let task = TaskId::new();

        store
            .save_history(&task, &[TurnRecord::user("ok")])
            .await
            .unwrap();
        let path = store.history_path(&task);
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("{not json\n");
        tokio::fs::write(&path, content).await.unwrap();

        let err = store.load_history(&task).await.unwrap_err();
        assert!(matches!(err, PersistError::Corrupted(_)));
    }

    #[tokio::test]
    async fn save_overwrites_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let task = TaskId::new();

        store
            .save_history(&task, &[TurnRecord::user("v1")])
            .await
            .unwrap();
        let longer = vec![TurnRecord::user("v2"), TurnRecord::assistant("reply")];
        store.save_history(&task, &longer).await.unwrap();

        let loaded = store.load_history(&task).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].text(), "v2");
    }
}
