//! The task loop: repeated provider turns until completion or abort.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coxswain_bus::ApprovalBus;
use coxswain_core::approval::NotifyKind;
use coxswain_core::block::{ImageData, TaskId, TaskStatus, TurnRecord, Usage};
use coxswain_core::error::{PersistError, Result, TaskError};
use coxswain_core::persist::Persistence;
use coxswain_core::provider::{ProviderClient, StreamEvent};
use coxswain_core::tool::ToolRegistry;
use coxswain_history::HistoryManager;
use coxswain_parser::parse_blocks;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::presenter::{PresenterPolicy, TurnPresenter};
use crate::prompt::build_system_prompt;

/// Injected as the next user record when the model produces a turn with
/// no tool use at all.
const NO_TOOL_PROMPT: &str = "[ERROR] You did not use a tool in your previous \
    response. Every response must contain exactly one tool use. Retry with a \
    tool, or use attempt_completion if the task is done.";

/// Stronger corrective after repeated stalls or mistakes.
const ESCALATION_PROMPT: &str = "You are repeatedly failing to make progress. \
    Stop and reconsider: re-read the task, review the tool results you already \
    have, and choose ONE concrete next tool use. If you are blocked on missing \
    information, use ask_followup_question. If the task is in fact complete, \
    use attempt_completion.";

/// Appended to a user record on resume so the model knows the session
/// restarted.
const RESUME_PROMPT: &str = "This task was interrupted and has now been \
    resumed. Re-assess the current state before continuing; earlier tool \
    effects may or may not still hold.";

const INTERRUPTED_MARKER: &str = "\n\n[turn interrupted; response may be incomplete]";

/// Tunables for a task run.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub always_allow_read_only: bool,
    pub custom_instructions: Option<String>,
    /// Overrides the provider's advertised context window.
    pub context_window: Option<u64>,
    pub workdir: PathBuf,
}

/// Cooperative cancellation for a running task.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    signal: watch::Sender<bool>,
    bus: Arc<ApprovalBus>,
}

impl AbortHandle {
    /// Request the task stop. Unblocks any pending approval ask.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.signal.send(true);
        self.bus.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a finished task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: TaskId,
    pub status: TaskStatus,
    pub turns: u32,
}

/// Drives whole tasks against a provider, a tool registry, an approval
/// bus, and checkpoint storage.
pub struct TaskLoop {
    provider: Arc<dyn ProviderClient>,
    registry: Arc<ToolRegistry>,
    bus: Arc<ApprovalBus>,
    store: Arc<dyn Persistence>,
    options: TaskOptions,
    abort_flag: Arc<AtomicBool>,
    abort_signal: watch::Sender<bool>,
}

/// Everything a completed turn hands back to the loop.
struct TurnOutcome {
    raw_text: String,
    result_text: String,
    result_images: Vec<ImageData>,
    tool_used: bool,
    rejected: bool,
    completion_accepted: bool,
    mistakes: u32,
    usage: Usage,
}

enum TurnEnd {
    Finished(TurnOutcome),
    /// Transport failed mid-stream; carries whatever text had arrived.
    Interrupted { partial_text: String, reason: String },
    Aborted,
}

impl TaskLoop {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        registry: Arc<ToolRegistry>,
        bus: Arc<ApprovalBus>,
        store: Arc<dyn Persistence>,
        options: TaskOptions,
    ) -> Self {
        let (abort_signal, _) = watch::channel(false);
        Self {
            provider,
            registry,
            bus,
            store,
            options,
            abort_flag: Arc::new(AtomicBool::new(false)),
            abort_signal,
        }
    }

    /// Handle for cancelling the running task from another task or a
    /// signal handler.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.abort_flag),
            signal: self.abort_signal.clone(),
            bus: Arc::clone(&self.bus),
        }
    }

    /// Start a fresh task from operator-supplied text (and images).
    pub async fn start(&self, text: &str, images: Vec<ImageData>) -> Result<TaskReport> {
        if text.trim().is_empty() {
            return Err(TaskError::MissingArgument("task text").into());
        }

        let id = TaskId::new();
        if self.store.task_exists(&id).await? {
            return Err(TaskError::DuplicateTask(id.0.clone()).into());
        }

        info!(task = %id.0, "Starting task");
        let mut history = HistoryManager::new(id.clone(), Arc::clone(&self.store));
        history
            .append(TurnRecord::user_with_images(
                format!("<task>\n{}\n</task>", text.trim()),
                images,
            ))
            .await?;

        self.run(id, history).await
    }

    /// Resume a previously checkpointed task.
    pub async fn resume(&self, id: TaskId) -> Result<TaskReport> {
        let records = self
            .store
            .load_history(&id)
            .await?
            .ok_or_else(|| PersistError::NotFound(id.0.clone()))?;
        if records.is_empty() {
            return Err(PersistError::Corrupted(format!("task {} has empty history", id.0)).into());
        }

        info!(task = %id.0, records = records.len(), "Resuming task");
        self.bus.reset_cancelled();
        let mut history = HistoryManager::from_records(id.clone(), records, Arc::clone(&self.store))?;

        // The next provider call needs the history to end on a user record.
        if !history
            .records()
            .last()
            .map(TurnRecord::is_user)
            .unwrap_or(false)
        {
            history.append(TurnRecord::user(RESUME_PROMPT)).await?;
        }

        self.run(id, history).await
    }

    /// Checkpoint the operator transcript after every log change, so a
    /// resumed task can replay what the operator already saw.
    fn spawn_transcript_forwarder(&self, id: &TaskId) -> tokio::task::JoinHandle<()> {
        let mut events = self.bus.subscribe();
        let bus = Arc::clone(&self.bus);
        let store = Arc::clone(&self.store);
        let id = id.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Err(err) = store.save_transcript(&id, &bus.snapshot()).await {
                            warn!(task = %id.0, error = %err, "Transcript checkpoint failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn run(&self, id: TaskId, mut history: HistoryManager) -> Result<TaskReport> {
        let transcript_forwarder = self.spawn_transcript_forwarder(&id);
        let system_prompt = build_system_prompt(
            &self.registry,
            &self.options.workdir,
            self.options.custom_instructions.as_deref(),
        );
        let context_window = self
            .options
            .context_window
            .unwrap_or_else(|| self.provider.context_window());

        let mut turns: u32 = 0;
        let mut consecutive_mistakes: u32 = 0;
        let mut stall_count: u32 = 0;
        let mut usage = Usage::default();

        let status = loop {
            if self.abort_flag.load(Ordering::SeqCst) {
                break TaskStatus::Aborted;
            }

            history.truncate_if_over_budget(&usage, context_window).await?;

            let end = self.run_turn(&system_prompt, &history).await?;
            turns += 1;

            match end {
                TurnEnd::Aborted => break TaskStatus::Aborted,
                TurnEnd::Interrupted {
                    partial_text,
                    reason,
                } => {
                    warn!(task = %id.0, %reason, "Turn interrupted by transport failure");
                    // run_turn cancelled the bus to quiesce the dead turn;
                    // re-arm it for the retry prompt.
                    self.bus.reset_cancelled();
                    if !partial_text.is_empty() {
                        history
                            .append(TurnRecord::assistant(format!(
                                "{partial_text}{INTERRUPTED_MARKER}"
                            )))
                            .await?;
                        history
                            .append(TurnRecord::user(
                                "Your previous response was cut off by a transport \
                                 failure. It may be incomplete; continue from where \
                                 it stopped.",
                            ))
                            .await?;
                    }
                    self.bus.notify(
                        NotifyKind::Error,
                        format!("Model request failed: {reason}"),
                        Vec::new(),
                        false,
                    );
                    match self
                        .bus
                        .ask(
                            coxswain_core::approval::AskKind::ResumeAfterError,
                            "The model request failed. Retry?",
                        )
                        .await
                    {
                        Ok(response) if response.is_approved() => continue,
                        _ => break TaskStatus::Aborted,
                    }
                }
                TurnEnd::Finished(outcome) => {
                    usage.add(&outcome.usage);

                    if outcome.raw_text.is_empty() {
                        history
                            .append(TurnRecord::assistant(
                                "Failure: no assistant response was produced.",
                            ))
                            .await?;
                    } else {
                        history.append(TurnRecord::assistant(outcome.raw_text)).await?;
                    }

                    if outcome.completion_accepted {
                        break TaskStatus::Completed;
                    }

                    let mut next_user = String::new();
                    // A rejected turn is not a stall: the feedback in the
                    // turn result is what the model should react to.
                    if outcome.tool_used || outcome.rejected {
                        stall_count = 0;
                        if outcome.mistakes == 0 {
                            consecutive_mistakes = 0;
                        } else {
                            consecutive_mistakes += outcome.mistakes;
                        }
                        next_user.push_str(&outcome.result_text);
                    } else {
                        stall_count += 1;
                        consecutive_mistakes += 1;
                        if !outcome.result_text.is_empty() {
                            next_user.push_str(&outcome.result_text);
                            next_user.push_str("\n\n");
                        }
                        next_user.push_str(NO_TOOL_PROMPT);
                    }

                    if consecutive_mistakes >= 3 || stall_count > 2 {
                        warn!(task = %id.0, consecutive_mistakes, stall_count, "Escalating corrective prompt");
                        next_user.push_str("\n\n");
                        next_user.push_str(ESCALATION_PROMPT);
                        consecutive_mistakes = 0;
                        stall_count = 0;
                    }

                    history
                        .append(TurnRecord::user_with_images(next_user, outcome.result_images))
                        .await?;
                }
            }
        };

        if status == TaskStatus::Aborted {
            self.registry.teardown_all().await;
            self.bus.notify(NotifyKind::Status, "Task aborted.", Vec::new(), false);
        } else {
            self.bus.notify(NotifyKind::Status, "Task completed.", Vec::new(), false);
        }

        // Final snapshot after the forwarder stops, so the last messages
        // are never lost to an in-flight write.
        transcript_forwarder.abort();
        if let Err(err) = self.store.save_transcript(&id, &self.bus.snapshot()).await {
            warn!(task = %id.0, error = %err, "Failed to persist transcript");
        }

        info!(task = %id.0, ?status, turns, "Task finished");
        Ok(TaskReport {
            task: id,
            status,
            turns,
        })
    }

    /// Run one provider turn through the presenter. Never returns a
    /// transport error as `Err`; those become [`TurnEnd::Interrupted`]
    /// so the loop can offer a retry.
    async fn run_turn(&self, system_prompt: &str, history: &HistoryManager) -> Result<TurnEnd> {
        let presenter = TurnPresenter::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.registry),
            PresenterPolicy {
                always_allow_read_only: self.options.always_allow_read_only,
            },
            Arc::clone(&self.abort_flag),
        );
        let mut ready = presenter.ready();
        let mut abort_rx = self.abort_signal.subscribe();
        if self.abort_flag.load(Ordering::SeqCst) {
            return Ok(TurnEnd::Aborted);
        }

        let mut rx = match self
            .provider
            .stream_turn(system_prompt, history.records())
            .await
        {
            Ok(rx) => rx,
            Err(err) => {
                return Ok(TurnEnd::Interrupted {
                    partial_text: String::new(),
                    reason: err.to_string(),
                })
            }
        };

        let tool_names: Vec<&str> = self.registry.names();
        let mut buffer = String::new();
        let mut usage = Usage::default();
        let mut transport_error: Option<String> = None;

        loop {
            tokio::select! {
                biased;
                changed = abort_rx.changed() => {
                    if changed.is_err() || *abort_rx.borrow() {
                        presenter.finalize_stream();
                        presenter.poke();
                        return Ok(TurnEnd::Aborted);
                    }
                }
                event = rx.recv() => match event {
                    Some(Ok(StreamEvent::Text { content })) => {
                        buffer.push_str(&content);
                        presenter.update_blocks(parse_blocks(&buffer, &tool_names));
                        presenter.poke();
                    }
                    Some(Ok(StreamEvent::Usage(u))) => usage.add(&u),
                    Some(Err(err)) => {
                        transport_error = Some(err.to_string());
                        break;
                    }
                    None => break,
                }
            }
        }

        if let Some(reason) = transport_error {
            // The turn is being discarded: quiesce the presenter first so
            // no approval ask from the dead turn can supersede the retry
            // prompt, then let it drain.
            presenter.interrupt();
            presenter.finalize_stream();
            presenter.poke();
            while !*ready.borrow_and_update() {
                if ready.changed().await.is_err() {
                    break;
                }
            }
            return Ok(TurnEnd::Interrupted {
                partial_text: buffer,
                reason,
            });
        }

        // Normal end: force-close partial blocks and let the presenter
        // drain.
        presenter.finalize_stream();
        presenter.poke();

        while !*ready.borrow_and_update() {
            if ready.changed().await.is_err() {
                break;
            }
        }

        if self.abort_flag.load(Ordering::SeqCst) {
            return Ok(TurnEnd::Aborted);
        }

        let (result_text, result_images) = presenter.take_result();
        Ok(TurnEnd::Finished(TurnOutcome {
            raw_text: buffer,
            result_text,
            result_images,
            tool_used: presenter.tool_used(),
            rejected: presenter.rejected(),
            completion_accepted: presenter.completion_accepted(),
            mistakes: presenter.mistakes(),
            usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coxswain_core::approval::{ApprovalResponse, AskKind, MessagePayload};
    use coxswain_core::error::{Error, ProviderError};
    use coxswain_history::NoopStore;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Plays back one scripted response per turn and records the history
    /// each turn was given.
    struct ScriptedProvider {
        turns: Mutex<Vec<Vec<ScriptedEvent>>>,
        seen: Arc<Mutex<Vec<Vec<TurnRecord>>>>,
    }

    enum ScriptedEvent {
        Text(&'static str),
        Fail(&'static str),
    }

    impl ScriptedProvider {
        fn new(turns: Vec<Vec<ScriptedEvent>>) -> Self {
            Self {
                turns: Mutex::new(turns),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn seen_histories(&self) -> Arc<Mutex<Vec<Vec<TurnRecord>>>> {
            Arc::clone(&self.seen)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream_turn(
            &self,
            _system_prompt: &str,
            history: &[TurnRecord],
        ) -> std::result::Result<
            mpsc::Receiver<std::result::Result<StreamEvent, ProviderError>>,
            ProviderError,
        > {
            self.seen.lock().unwrap().push(history.to_vec());
            let mut turns = self.turns.lock().unwrap();
            let events = if turns.is_empty() {
                Vec::new()
            } else {
                turns.remove(0)
            };
            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                for event in events {
                    let payload = match event {
                        ScriptedEvent::Text(t) => Ok(StreamEvent::Text {
                            content: t.to_string(),
                        }),
                        ScriptedEvent::Fail(reason) => {
                            Err(ProviderError::StreamInterrupted(reason.to_string()))
                        }
                    };
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    /// Approves every ask that appears.
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

    struct MarkerTool {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl coxswain_core::tool::Tool for MarkerTool {
        fn name(&self) -> &str {
            "marker"
        }
        fn description(&self) -> &str {
            "Records invocations"
        }
        fn required_params(&self) -> &[&'static str] {
            &["value"]
        }
        async fn execute(
            &self,
            params: BTreeMap<String, String>,
            _feed: Option<coxswain_core::tool::OutputFeed>,
        ) -> std::result::Result<coxswain_core::tool::ToolOutcome, coxswain_core::error::ToolError>
        {
            let value = params.get("value").cloned().unwrap_or_default();
            self.calls.lock().unwrap().push(value.clone());
            Ok(coxswain_core::tool::ToolOutcome::text(format!(
                "marker ran: {value}"
            )))
        }
    }

    fn task_loop_with(
        provider: ScriptedProvider,
        calls: Arc<Mutex<Vec<String>>>,
    ) -> (TaskLoop, Arc<ApprovalBus>) {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(MarkerTool {
            calls: Arc::clone(&calls),
        }));
        registry.register(Box::new(coxswain_tools::AttemptCompletionTool));
        registry.register(Box::new(coxswain_tools::AskFollowupTool));

        let bus = Arc::new(ApprovalBus::new());
        let task_loop = TaskLoop::new(
            Arc::new(provider),
            Arc::new(registry),
            Arc::clone(&bus),
            Arc::new(NoopStore),
            TaskOptions {
                workdir: PathBuf::from("/tmp"),
                ..TaskOptions::default()
            },
        );
        (task_loop, bus)
    }

    #[tokio::test]
    async fn empty_task_text_is_a_construction_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (task_loop, _bus) = task_loop_with(ScriptedProvider::new(vec![]), calls);
        let err = task_loop.start("   ", Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Task(TaskError::MissingArgument("task text"))
        ));
    }

    #[tokio::test]
    async fn tool_turn_then_completion_finishes_the_task() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (task_loop, bus) = task_loop_with(
            ScriptedProvider::new(vec![
                vec![ScriptedEvent::Text(
                    "Let me check.<marker><value>one</value></marker>",
                )],
                vec![ScriptedEvent::Text(
                    "<attempt_completion><result>All done.</result></attempt_completion>",
                )],
            ]),
            Arc::clone(&calls),
        );
        approve_everything(Arc::clone(&bus));

        let report = task_loop.start("do the thing", Vec::new()).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.turns, 2);
        assert_eq!(calls.lock().unwrap().as_slice(), ["one".to_string()]);
    }

    #[tokio::test]
    async fn turn_without_tool_gets_corrective_prompt() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (task_loop, bus) = task_loop_with(
            ScriptedProvider::new(vec![
                vec![ScriptedEvent::Text("I will just chat instead.")],
                vec![ScriptedEvent::Text(
                    "<attempt_completion><result>ok</result></attempt_completion>",
                )],
            ]),
            Arc::clone(&calls),
        );
        approve_everything(Arc::clone(&bus));

        let report = task_loop.start("please work", Vec::new()).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.turns, 2);
        // The corrective prompt surfaced nowhere on the bus; it only goes
        // back to the model.
        let log = bus.snapshot();
        assert!(log.iter().all(|m| match &m.payload {
            MessagePayload::Notify { text, .. } => !text.contains("[ERROR] You did not"),
            MessagePayload::Ask { .. } => true,
        }));
    }

    #[tokio::test]
    async fn only_first_tool_of_a_turn_executes() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (task_loop, bus) = task_loop_with(
            ScriptedProvider::new(vec![
                vec![ScriptedEvent::Text(
                    "<marker><value>a</value></marker><marker><value>b</value></marker>",
                )],
                vec![ScriptedEvent::Text(
                    "<attempt_completion><result>done</result></attempt_completion>",
                )],
            ]),
            Arc::clone(&calls),
        );
        approve_everything(Arc::clone(&bus));

        let report = task_loop.start("run both", Vec::new()).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(calls.lock().unwrap().as_slice(), ["a".to_string()]);
    }

    #[tokio::test]
    async fn transport_failure_offers_resume_and_retry_succeeds() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (task_loop, bus) = task_loop_with(
            ScriptedProvider::new(vec![
                vec![
                    ScriptedEvent::Text("partial thought"),
                    ScriptedEvent::Fail("connection reset"),
                ],
                vec![ScriptedEvent::Text(
                    "<attempt_completion><result>recovered</result></attempt_completion>",
                )],
            ]),
            Arc::clone(&calls),
        );
        approve_everything(Arc::clone(&bus));

        let report = task_loop.start("survive a blip", Vec::new()).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);

        let log = bus.snapshot();
        assert!(log.iter().any(|m| matches!(
            &m.payload,
            MessagePayload::Ask { kind: AskKind::ResumeAfterError, .. }
        )));
        assert!(log.iter().any(|m| matches!(
            &m.payload,
            MessagePayload::Notify { kind: NotifyKind::Error, text, .. } if text.contains("connection reset")
        )));
    }

    #[tokio::test]
    async fn transport_failure_after_complete_tool_block_still_recovers() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let provider = ScriptedProvider::new(vec![
            vec![
                ScriptedEvent::Text("<marker><value>x</value>"),
                ScriptedEvent::Text("</marker>"),
                ScriptedEvent::Fail("connection reset"),
            ],
            vec![ScriptedEvent::Text(
                "<attempt_completion><result>recovered</result></attempt_completion>",
            )],
        ]);
        let (task_loop, bus) = task_loop_with(provider, Arc::clone(&calls));

        // Approve everything except tool asks, so the approval for the
        // tool of the failing turn is still pending when the stream dies.
        let resolver_bus = Arc::clone(&bus);
        tokio::spawn(async move {
            loop {
                if let Some(token) = resolver_bus.pending_token() {
                    let is_tool = resolver_bus.snapshot().iter().any(|m| {
                        m.token == token
                            && matches!(
                                &m.payload,
                                MessagePayload::Ask {
                                    kind: AskKind::Tool,
                                    ..
                                }
                            )
                    });
                    if !is_tool {
                        resolver_bus.resolve(token, ApprovalResponse::Approved);
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let report = task_loop
            .start("survive a mid-turn loss", Vec::new())
            .await
            .unwrap();
        assert_eq!(
            report.status,
            TaskStatus::Completed,
            "an approved resume must retry the turn, not abort the task"
        );
        assert!(
            calls.lock().unwrap().is_empty(),
            "a tool from the discarded turn must not run"
        );
    }

    #[tokio::test]
    async fn rejected_turn_is_not_treated_as_a_missing_tool_use() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let provider = ScriptedProvider::new(vec![
            vec![ScriptedEvent::Text("<marker><value>x</value></marker>")],
            vec![ScriptedEvent::Text(
                "<attempt_completion><result>adjusted</result></attempt_completion>",
            )],
        ]);
        let seen = provider.seen_histories();
        let (task_loop, bus) = task_loop_with(provider, Arc::clone(&calls));

        // First ask is denied with feedback, everything after approves.
        let resolver_bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let mut first = true;
            loop {
                if let Some(token) = resolver_bus.pending_token() {
                    let response = if first {
                        first = false;
                        ApprovalResponse::Feedback {
                            text: "use python instead".to_string(),
                            images: Vec::new(),
                        }
                    } else {
                        ApprovalResponse::Approved
                    };
                    resolver_bus.resolve(token, response);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let report = task_loop.start("try a tool", Vec::new()).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);

        // The second turn's last user record carries the feedback alone,
        // without the no-tool corrective.
        let histories = seen.lock().unwrap();
        let second_turn = histories.get(1).expect("second turn was requested");
        let last_user = second_turn.last().expect("history is non-empty");
        assert!(last_user.is_user());
        assert!(last_user
            .text()
            .contains("<feedback>\nuse python instead\n</feedback>"));
        assert!(
            !last_user.text().contains("You did not use a tool"),
            "a human rejection is feedback, not a stalled turn"
        );
    }

    #[tokio::test]
    async fn abort_stops_the_loop() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        // A provider that never finishes its stream.
        struct StallingProvider;
        #[async_trait]
        impl ProviderClient for StallingProvider {
            fn name(&self) -> &str {
                "stalling"
            }
            async fn stream_turn(
                &self,
                _system_prompt: &str,
                _history: &[TurnRecord],
            ) -> std::result::Result<
                mpsc::Receiver<std::result::Result<StreamEvent, ProviderError>>,
                ProviderError,
            > {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    let _keepalive = tx;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
                Ok(rx)
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Box::new(MarkerTool {
            calls: Arc::clone(&calls),
        }));
        let bus = Arc::new(ApprovalBus::new());
        let task_loop = TaskLoop::new(
            Arc::new(StallingProvider),
            Arc::new(registry),
            Arc::clone(&bus),
            Arc::new(NoopStore),
            TaskOptions {
                workdir: PathBuf::from("/tmp"),
                ..TaskOptions::default()
            },
        );
        let handle = task_loop.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.abort();
        });

        let report = task_loop.start("never finishes", Vec::new()).await.unwrap();
        assert_eq!(report.status, TaskStatus::Aborted);
    }

    #[tokio::test]
    async fn rejected_tool_feeds_feedback_to_next_turn() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (task_loop, bus) = task_loop_with(
            ScriptedProvider::new(vec![
                vec![ScriptedEvent::Text("<marker><value>x</value></marker>")],
                vec![ScriptedEvent::Text(
                    "<attempt_completion><result>stopping</result></attempt_completion>",
                )],
            ]),
            Arc::clone(&calls),
        );
        // First ask gets feedback (a rejection), everything after approves.
        let resolver_bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let mut first = true;
            loop {
                if let Some(token) = resolver_bus.pending_token() {
                    let response = if first {
                        first = false;
                        ApprovalResponse::Feedback {
                            text: "do not run that".to_string(),
                            images: Vec::new(),
                        }
                    } else {
                        ApprovalResponse::Approved
                    };
                    resolver_bus.resolve(token, response);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let report = task_loop.start("try a tool", Vec::new()).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert!(calls.lock().unwrap().is_empty(), "rejected tool must not run");
    }
}
