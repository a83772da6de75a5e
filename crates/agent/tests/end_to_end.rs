//! End-to-end task run: a scripted provider stream drives a real
//! `write_to_file` call followed by `attempt_completion`, with an
//! auto-approving operator on the bus.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coxswain_agent::{TaskLoop, TaskOptions};
use coxswain_bus::ApprovalBus;
use coxswain_core::approval::ApprovalResponse;
use coxswain_core::block::{TaskStatus, TurnRecord};
use coxswain_core::error::ProviderError;
use coxswain_core::provider::{ProviderClient, StreamEvent};
use coxswain_history::NoopStore;
use tokio::sync::mpsc;

/// Plays back one response per turn, delivered in small chunks so the
/// parser sees genuinely partial blocks along the way.
struct ScriptedProvider {
    turns: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_turn(
        &self,
        _system_prompt: &str,
        _history: &[TurnRecord],
    ) -> Result<mpsc::Receiver<Result<StreamEvent, ProviderError>>, ProviderError> {
        let mut turns = self.turns.lock().unwrap();
        let response = if turns.is_empty() { "" } else { turns.remove(0) };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut rest = response;
            while !rest.is_empty() {
                let mut cut = rest.len().min(7);
                while !rest.is_char_boundary(cut) {
                    cut += 1;
                }
                let (chunk, tail) = rest.split_at(cut);
                rest = tail;
                if tx
                    .send(Ok(StreamEvent::Text {
                        content: chunk.to_string(),
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn approve_everything(bus: Arc<ApprovalBus>) {
    tokio::spawn(async move {
        loop {
            if let Some(token) = bus.pending_token() {
                bus.resolve(token, ApprovalResponse::Approved);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
}

#[tokio::test]
async fn scripted_task_writes_a_file_and_completes() {
    let dir = tempfile::tempdir().unwrap();

    let provider = ScriptedProvider {
        turns: Mutex::new(vec![
            "I'll create the file now.\n\
             <write_to_file>\n\
             <path>notes.txt</path>\n\
             <content>hello from the agent</content>\n\
             </write_to_file>",
            "<attempt_completion>\n\
             <result>Created notes.txt with the requested content.</result>\n\
             </attempt_completion>",
        ]),
    };

    let bus = Arc::new(ApprovalBus::new());
    approve_everything(Arc::clone(&bus));

    let task_loop = TaskLoop::new(
        Arc::new(provider),
        Arc::new(coxswain_tools::default_registry(dir.path())),
        Arc::clone(&bus),
        Arc::new(NoopStore),
        TaskOptions {
            workdir: PathBuf::from(dir.path()),
            ..TaskOptions::default()
        },
    );

    let report = task_loop
        .start("create notes.txt containing a greeting", Vec::new())
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.turns, 2);

    let written = std::fs::read_to_string(dir.path().join("notes.txt")).unwrap();
    assert_eq!(written, "hello from the agent");
}
