//! Turn presenter: walks the content blocks of one assistant turn.
//!
//! Blocks arrive re-parsed from the growing stream buffer, so the block
//! list only ever refines monotonically. The presenter holds a cursor
//! into that list and processes one block at a time. Processing can
//! suspend for a long time (an approval ask, a running command), while
//! stream chunks keep arriving; the `locked` / `pending_update` pair
//! coalesces those arrivals into a single re-entry once the in-flight
//! block finishes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use coxswain_bus::ApprovalBus;
use coxswain_core::approval::{ApprovalResponse, AskKind, NotifyKind};
use coxswain_core::block::{ContentBlock, ImageData, ToolParams};
use coxswain_core::tool::ToolRegistry;
use coxswain_parser::{strip_reasoning, trim_dangling_tag};
use coxswain_tools::{COMPLETION_TOOL, EXECUTE_COMMAND_TOOL, FOLLOWUP_TOOL};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Knobs the presenter inherits from task configuration.
#[derive(Debug, Clone, Default)]
pub struct PresenterPolicy {
    /// Skip the approval gate for tools that declare themselves read-only.
    pub always_allow_read_only: bool,
}

/// Mutable turn state. Held behind a std Mutex in short critical
/// sections only; never across an await point.
struct TurnState {
    blocks: Vec<ContentBlock>,
    current_index: usize,
    locked: bool,
    pending_update: bool,
    stream_finished: bool,
    result_parts: Vec<String>,
    result_images: Vec<ImageData>,
    ready_sent: bool,
}

/// Presents the blocks of a single assistant turn to the operator,
/// executing at most one tool, and accumulates the turn result that
/// becomes the next user record.
pub struct TurnPresenter {
    state: Mutex<TurnState>,
    bus: Arc<ApprovalBus>,
    registry: Arc<ToolRegistry>,
    policy: PresenterPolicy,
    abort: Arc<AtomicBool>,
    /// Set when the turn is being discarded (transport failure). Stops
    /// the presenter from issuing any further approval asks.
    discard: AtomicBool,
    // Sticky for the remainder of the turn once set.
    rejected: AtomicBool,
    tool_used: AtomicBool,
    completion_accepted: AtomicBool,
    mistakes: AtomicU32,
    ready_tx: watch::Sender<bool>,
}

/// What to do with the cursor after processing a block.
enum Step {
    Advance,
    Stay,
}

impl TurnPresenter {
    pub fn new(
        bus: Arc<ApprovalBus>,
        registry: Arc<ToolRegistry>,
        policy: PresenterPolicy,
        abort: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(TurnState {
                blocks: Vec::new(),
                current_index: 0,
                locked: false,
                pending_update: false,
                stream_finished: false,
                result_parts: Vec::new(),
                result_images: Vec::new(),
                ready_sent: false,
            }),
            bus,
            registry,
            policy,
            abort,
            discard: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
            tool_used: AtomicBool::new(false),
            completion_accepted: AtomicBool::new(false),
            mistakes: AtomicU32::new(0),
            ready_tx,
        })
    }

    /// A watch that flips to `true` exactly once, when every block has
    /// been processed after the stream finished.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Replace the block list with a fresh re-parse of the stream buffer.
    pub fn update_blocks(&self, blocks: Vec<ContentBlock>) {
        let mut state = self.state.lock().expect("presenter state poisoned");
        state.blocks = blocks;
    }

    /// Mark the stream as finished and force-close any still-partial
    /// block. Shared between normal stream end and abort.
    pub fn finalize_stream(&self) {
        let mut state = self.state.lock().expect("presenter state poisoned");
        state.stream_finished = true;
        for block in &mut state.blocks {
            block.close();
        }
    }

    /// Discard the rest of the turn. Unblocks any in-flight ask and
    /// makes every remaining block a no-op, so a dead turn cannot
    /// register an approval request or execute a tool after the caller
    /// has moved on. The caller owns re-arming the bus.
    pub fn interrupt(&self) {
        self.discard.store(true, Ordering::SeqCst);
        self.bus.cancel();
    }

    /// Drive the state machine on a fresh task so a suspended block
    /// never blocks stream consumption.
    pub fn poke(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.present().await });
    }

    /// Run the presenter until it runs out of complete blocks or finds
    /// another invocation already in flight.
    pub async fn present(self: &Arc<Self>) {
        loop {
            let block = {
                let mut state = self.state.lock().expect("presenter state poisoned");
                if state.locked {
                    state.pending_update = true;
                    return;
                }
                if state.current_index >= state.blocks.len() {
                    if state.stream_finished {
                        self.mark_ready(&mut state);
                    }
                    return;
                }
                state.locked = true;
                state.blocks[state.current_index].clone()
            };

            let step = self.process_block(&block).await;

            let run_again = {
                let mut state = self.state.lock().expect("presenter state poisoned");
                state.locked = false;
                let mut again = false;
                if matches!(step, Step::Advance) {
                    state.current_index += 1;
                    if state.current_index < state.blocks.len() {
                        again = true;
                    } else if state.stream_finished {
                        self.mark_ready(&mut state);
                    }
                }
                if state.pending_update {
                    state.pending_update = false;
                    again = true;
                }
                again
            };
            if !run_again {
                return;
            }
        }
    }

    fn mark_ready(&self, state: &mut TurnState) {
        if !state.ready_sent {
            state.ready_sent = true;
            let _ = self.ready_tx.send(true);
        }
    }

    async fn process_block(&self, block: &ContentBlock) -> Step {
        if self.abort.load(Ordering::SeqCst) || self.discard.load(Ordering::SeqCst) {
            // The task loop owns abort handling; just stop advancing and
            // release anyone waiting on the turn.
            let mut state = self.state.lock().expect("presenter state poisoned");
            self.mark_ready(&mut state);
            return Step::Stay;
        }

        match block {
            ContentBlock::Text { content, partial } => self.process_text(content, *partial),
            ContentBlock::ToolUse {
                name,
                params,
                partial,
            } => self.process_tool_use(name, params, *partial).await,
        }
    }

    fn process_text(&self, content: &str, partial: bool) -> Step {
        // Once a tool ran or was rejected, the rest of the turn's prose
        // is dropped; the model will see the tool result instead.
        if self.rejected.load(Ordering::SeqCst) || self.tool_used.load(Ordering::SeqCst) {
            return if partial { Step::Stay } else { Step::Advance };
        }

        let cleaned = strip_reasoning(content);
        let cleaned = trim_dangling_tag(&cleaned);
        if !cleaned.is_empty() {
            self.bus
                .notify(NotifyKind::Text, cleaned, Vec::new(), partial);
        }
        if partial {
            Step::Stay
        } else {
            Step::Advance
        }
    }

    async fn process_tool_use(&self, name: &str, params: &ToolParams, partial: bool) -> Step {
        if self.rejected.load(Ordering::SeqCst) {
            if partial {
                return Step::Stay;
            }
            self.push_result(format!(
                "Skipping tool [{name}] due to user rejecting a previous tool."
            ));
            return Step::Advance;
        }

        if self.tool_used.load(Ordering::SeqCst) {
            if partial {
                return Step::Stay;
            }
            self.push_result(format!(
                "Tool [{name}] was not executed because a tool has already been \
                 used in this message. Only one tool may be used per message. \
                 You must assess the first tool's result before proceeding."
            ));
            return Step::Advance;
        }

        if partial {
            self.bus
                .ask_partial(self.ask_kind_for(name), render_invocation(name, params));
            return Step::Stay;
        }

        match name {
            FOLLOWUP_TOOL => self.handle_followup(params).await,
            COMPLETION_TOOL => self.handle_completion(params).await,
            _ => self.handle_regular_tool(name, params).await,
        }
        Step::Advance
    }

    fn ask_kind_for(&self, name: &str) -> AskKind {
        match name {
            FOLLOWUP_TOOL => AskKind::Followup,
            COMPLETION_TOOL => AskKind::Completion,
            EXECUTE_COMMAND_TOOL => AskKind::Command,
            _ => AskKind::Tool,
        }
    }

    async fn handle_followup(&self, params: &ToolParams) {
        let question = match params.get("question") {
            Some(q) if !q.trim().is_empty() => q.clone(),
            _ => {
                self.record_mistake(FOLLOWUP_TOOL, "question");
                return;
            }
        };

        match self.bus.ask(AskKind::Followup, question).await {
            Ok(ApprovalResponse::Feedback { text, images }) => {
                self.tool_used.store(true, Ordering::SeqCst);
                self.push_result(format!("<answer>\n{text}\n</answer>"));
                self.push_images(images);
            }
            Ok(_) => {
                self.tool_used.store(true, Ordering::SeqCst);
                self.push_result(
                    "The user did not provide an answer to the question.".to_string(),
                );
            }
            Err(err) => {
                debug!(error = %err, "Followup ask aborted");
                self.rejected.store(true, Ordering::SeqCst);
                self.push_result("The question was interrupted before an answer arrived.".to_string());
            }
        }
    }

    async fn handle_completion(&self, params: &ToolParams) {
        let result = match params.get("result") {
            Some(r) if !r.trim().is_empty() => r.clone(),
            _ => {
                self.record_mistake(COMPLETION_TOOL, "result");
                return;
            }
        };

        self.bus
            .notify(NotifyKind::Status, result.clone(), Vec::new(), false);

        match self.bus.ask(AskKind::Completion, result).await {
            Ok(ApprovalResponse::Approved) => {
                self.tool_used.store(true, Ordering::SeqCst);
                self.completion_accepted.store(true, Ordering::SeqCst);
            }
            Ok(ApprovalResponse::Feedback { text, images }) => {
                self.tool_used.store(true, Ordering::SeqCst);
                self.push_result(format!(
                    "The user has provided feedback on the results. Consider \
                     their input to continue the task, then attempt completion \
                     again.\n<feedback>\n{text}\n</feedback>"
                ));
                self.push_images(images);
            }
            Ok(ApprovalResponse::Denied) => {
                self.tool_used.store(true, Ordering::SeqCst);
                self.push_result(
                    "The user is not satisfied with the result. Continue the task."
                        .to_string(),
                );
            }
            Err(err) => {
                debug!(error = %err, "Completion ask aborted");
                self.rejected.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn handle_regular_tool(&self, name: &str, params: &ToolParams) {
        let Some(tool) = self.registry.get(name) else {
            self.mistakes.fetch_add(1, Ordering::SeqCst);
            let note = format!(
                "Unknown tool '{name}'. It was not executed. Use one of the \
                 tools documented in the system prompt."
            );
            self.bus
                .notify(NotifyKind::Error, note.clone(), Vec::new(), false);
            self.push_result(note);
            return;
        };

        if let Some(missing) = tool.validate(params) {
            self.record_mistake(name, missing);
            return;
        }

        let auto_approved = self.policy.always_allow_read_only && tool.read_only();
        if !auto_approved {
            match self
                .bus
                .ask(self.ask_kind_for(name), render_invocation(name, params))
                .await
            {
                Ok(ApprovalResponse::Approved) => {}
                Ok(ApprovalResponse::Feedback { text, images }) => {
                    self.rejected.store(true, Ordering::SeqCst);
                    self.push_result(format!(
                        "The user denied this operation and provided the \
                         following feedback:\n<feedback>\n{text}\n</feedback>"
                    ));
                    self.push_images(images);
                    return;
                }
                Ok(ApprovalResponse::Denied) => {
                    self.rejected.store(true, Ordering::SeqCst);
                    self.push_result("The user denied this operation.".to_string());
                    return;
                }
                Err(err) => {
                    debug!(error = %err, "Tool approval aborted");
                    self.rejected.store(true, Ordering::SeqCst);
                    self.push_result("Tool approval was interrupted.".to_string());
                    return;
                }
            }
        }

        // Live output lines stream to the operator via a side task; the
        // bus coalesces partial revisions into one growing message.
        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<String>();
        let feed_bus = Arc::clone(&self.bus);
        let feed_task = tokio::spawn(async move {
            let mut accumulated = String::new();
            while let Some(line) = feed_rx.recv().await {
                if !accumulated.is_empty() {
                    accumulated.push('\n');
                }
                accumulated.push_str(&line);
                feed_bus.notify(
                    NotifyKind::CommandOutput,
                    accumulated.clone(),
                    Vec::new(),
                    true,
                );
            }
            accumulated
        });

        let invoked = self
            .registry
            .dispatch(name, params.clone(), Some(feed_tx))
            .await;

        // The feed sender is gone once dispatch returns; close out any
        // streamed output with a final full revision.
        if let Ok(streamed) = feed_task.await {
            if !streamed.is_empty() {
                self.bus
                    .notify(NotifyKind::CommandOutput, streamed, Vec::new(), false);
            }
        }

        self.tool_used.store(true, Ordering::SeqCst);
        match invoked {
            Ok(outcome) => {
                let kind = if outcome.is_error {
                    NotifyKind::Error
                } else {
                    NotifyKind::ToolResult
                };
                self.bus
                    .notify(kind, outcome.text.clone(), outcome.images.clone(), false);
                self.push_result(outcome.text);
                self.push_images(outcome.images);
            }
            Err(err) => {
                warn!(tool = name, error = %err, "Tool invocation failed");
                let note = format!("Error executing tool {name}: {err}");
                self.bus
                    .notify(NotifyKind::Error, note.clone(), Vec::new(), false);
                self.push_result(note);
            }
        }
    }

    fn record_mistake(&self, name: &str, missing: &str) {
        self.mistakes.fetch_add(1, Ordering::SeqCst);
        let note = format!(
            "Missing required parameter '{missing}' for tool '{name}'. This \
             tool was not executed. Retry with the complete parameter set."
        );
        self.bus
            .notify(NotifyKind::Error, note.clone(), Vec::new(), false);
        self.push_result(note);
    }

    fn push_result(&self, text: String) {
        let mut state = self.state.lock().expect("presenter state poisoned");
        state.result_parts.push(text);
    }

    fn push_images(&self, images: Vec<ImageData>) {
        if images.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("presenter state poisoned");
        state.result_images.extend(images);
    }

    pub fn tool_used(&self) -> bool {
        self.tool_used.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> bool {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn completion_accepted(&self) -> bool {
        self.completion_accepted.load(Ordering::SeqCst)
    }

    pub fn mistakes(&self) -> u32 {
        self.mistakes.load(Ordering::SeqCst)
    }

    /// Consume the accumulated turn result.
    pub fn take_result(&self) -> (String, Vec<ImageData>) {
        let mut state = self.state.lock().expect("presenter state poisoned");
        let text = state.result_parts.join("\n\n");
        state.result_parts.clear();
        let images = std::mem::take(&mut state.result_images);
        (text, images)
    }
}

/// Human-readable rendering of a tool invocation for the approval prompt.
fn render_invocation(name: &str, params: &ToolParams) -> String {
    let mut out = format!("Tool: {name}");
    for (key, value) in params {
        let mut cut = value.len().min(400);
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push_str(&format!("\n  {key}: {}", &value[..cut]));
        if cut < value.len() {
            out.push_str(" ...");
        }
    }
    out
}
