//! Approval/notification bus — the rendezvous point between the agent
//! loop and the human operator.
//!
//! The bus owns the operator-visible message log. `notify` is
//! fire-and-forget with partial-update coalescing (a streaming message
//! replaces its own previous revision instead of flooding the surface
//! with one entry per chunk). `ask` registers a question keyed by a
//! strictly increasing timestamp token and suspends the caller until a
//! response carrying that token arrives — or until the ask is superseded
//! or cancelled, in which case the wait aborts rather than hangs.
//!
//! At most one ask is outstanding at a time. Responses are matched by
//! token, never by position, so a late response to a superseded request
//! is silently discarded.

use chrono::Utc;
use coxswain_core::approval::{ApprovalResponse, AskKind, MessagePayload, NotifyKind, OperatorMessage};
use coxswain_core::block::ImageData;
use coxswain_core::error::BusError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

/// Changes to the message log, broadcast to the approval surface.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A new message was appended to the log.
    Appended(OperatorMessage),
    /// The message at `index` was replaced in place (partial update).
    Replaced { index: usize, message: OperatorMessage },
    /// A final ask is now waiting for a response.
    AskPending { token: i64 },
    /// The pending ask resolved (answered, superseded, or cancelled).
    AskResolved { token: i64 },
}

struct PendingAsk {
    token: i64,
    respond: oneshot::Sender<ApprovalResponse>,
}

#[derive(Default)]
struct BusState {
    log: Vec<OperatorMessage>,
    pending: Option<PendingAsk>,
    cancelled: bool,
}

/// The approval/notification bus.
pub struct ApprovalBus {
    state: Mutex<BusState>,
    last_token: AtomicI64,
    events: broadcast::Sender<BusEvent>,
}

impl ApprovalBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(BusState::default()),
            last_token: AtomicI64::new(0),
            events,
        }
    }

    /// Subscribe to log changes. Used by the approval surface and by the
    /// persistence forwarder.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// A copy of the full message log, for persistence snapshots.
    pub fn snapshot(&self) -> Vec<OperatorMessage> {
        self.state.lock().expect("bus state poisoned").log.clone()
    }

    /// Next strictly increasing timestamp token.
    fn next_token(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last_token.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last_token.compare_exchange_weak(
                prev,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    fn emit(&self, event: BusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Fire-and-forget notification with partial-update coalescing.
    ///
    /// If the immediately preceding log entry is a still-partial notify of
    /// the same kind, this call replaces its text and images in place.
    pub fn notify(&self, kind: NotifyKind, text: impl Into<String>, images: Vec<ImageData>, partial: bool) {
        let text = text.into();
        let mut state = self.state.lock().expect("bus state poisoned");

        if let Some(last) = state.log.last_mut() {
            if let MessagePayload::Notify {
                kind: last_kind,
                partial: true,
                ..
            } = &last.payload
            {
                if *last_kind == kind {
                    trace!(?kind, partial, "Coalescing partial notification");
                    last.payload = MessagePayload::Notify {
                        kind,
                        text,
                        images,
                        partial,
                    };
                    let message = last.clone();
                    let index = state.log.len() - 1;
                    drop(state);
                    self.emit(BusEvent::Replaced { index, message });
                    return;
                }
            }
        }

        let message = OperatorMessage {
            token: self.next_token(),
            payload: MessagePayload::Notify {
                kind,
                text,
                images,
                partial,
            },
        };
        state.log.push(message.clone());
        drop(state);
        self.emit(BusEvent::Appended(message));
    }

    /// Register or update a provisional prompt without waiting.
    ///
    /// Signals "still streaming, not yet actionable" to the surface.
    pub fn ask_partial(&self, kind: AskKind, text: impl Into<String>) {
        let text = text.into();
        let mut state = self.state.lock().expect("bus state poisoned");

        if let Some(last) = state.log.last_mut() {
            if let MessagePayload::Ask {
                kind: last_kind,
                partial: true,
                ..
            } = &last.payload
            {
                if *last_kind == kind {
                    last.payload = MessagePayload::Ask {
                        kind,
                        text,
                        partial: true,
                    };
                    let message = last.clone();
                    let index = state.log.len() - 1;
                    drop(state);
                    self.emit(BusEvent::Replaced { index, message });
                    return;
                }
            }
        }

        let message = OperatorMessage {
            token: self.next_token(),
            payload: MessagePayload::Ask {
                kind,
                text,
                partial: true,
            },
        };
        state.log.push(message.clone());
        drop(state);
        self.emit(BusEvent::Appended(message));
    }

    /// Register a final prompt and suspend until its response arrives.
    ///
    /// If a newer prompt is registered before this one resolves, the wait
    /// aborts with [`BusError::Superseded`]. If the bus is cancelled, it
    /// aborts with [`BusError::Cancelled`].
    pub async fn ask(
        &self,
        kind: AskKind,
        text: impl Into<String>,
    ) -> Result<ApprovalResponse, BusError> {
        let text = text.into();
        let (respond, wait) = oneshot::channel();
        let token;
        {
            let mut state = self.state.lock().expect("bus state poisoned");
            if state.cancelled {
                return Err(BusError::Cancelled);
            }

            token = self.next_token();

            // A still-pending older ask is superseded, never resolved.
            if let Some(stale) = state.pending.take() {
                warn!(stale_token = stale.token, "Superseding unresolved ask");
                // Dropping the sender aborts the old waiter.
            }

            // A partial revision of this same ask coalesces into the final one.
            let finalized = OperatorMessage {
                token,
                payload: MessagePayload::Ask {
                    kind,
                    text,
                    partial: false,
                },
            };
            let replaced = matches!(
                state.log.last(),
                Some(OperatorMessage {
                    payload: MessagePayload::Ask {
                        kind: last_kind,
                        partial: true,
                        ..
                    },
                    ..
                }) if *last_kind == kind
            );
            if replaced {
                let index = state.log.len() - 1;
                state.log[index] = finalized.clone();
                state.pending = Some(PendingAsk { token, respond });
                drop(state);
                self.emit(BusEvent::Replaced {
                    index,
                    message: finalized,
                });
            } else {
                state.log.push(finalized.clone());
                state.pending = Some(PendingAsk { token, respond });
                drop(state);
                self.emit(BusEvent::Appended(finalized));
            }
        }

        debug!(token, ?kind, "Awaiting operator response");
        self.emit(BusEvent::AskPending { token });

        let result = wait.await.map_err(|_| {
            // The sender was dropped: superseded by a newer ask, or the
            // bus was cancelled while we were waiting.
            if self.state.lock().expect("bus state poisoned").cancelled {
                BusError::Cancelled
            } else {
                BusError::Superseded
            }
        });
        self.emit(BusEvent::AskResolved { token });
        result
    }

    /// Deliver a response for the ask keyed by `token`.
    ///
    /// A stale token (not the currently pending ask) is silently
    /// discarded — never misapplied to a later request.
    pub fn resolve(&self, token: i64, response: ApprovalResponse) {
        let mut state = self.state.lock().expect("bus state poisoned");
        match state.pending.take() {
            Some(pending) if pending.token == token => {
                drop(state);
                debug!(token, "Resolving ask");
                // Waiter may have aborted already; that's fine.
                let _ = pending.respond.send(response);
            }
            other => {
                state.pending = other;
                debug!(token, "Discarding response for stale ask token");
            }
        }
    }

    /// Token of the currently pending ask, if any.
    pub fn pending_token(&self) -> Option<i64> {
        self.state
            .lock()
            .expect("bus state poisoned")
            .pending
            .as_ref()
            .map(|p| p.token)
    }

    /// Abort any in-flight ask without marking the bus cancelled.
    pub fn cancel_pending(&self) {
        let mut state = self.state.lock().expect("bus state poisoned");
        if let Some(stale) = state.pending.take() {
            debug!(token = stale.token, "Cancelling pending ask");
        }
    }

    /// Sticky cancellation: aborts the in-flight ask and makes every
    /// subsequent ask fail fast. Observed at every suspension point.
    pub fn cancel(&self) {
        let mut state = self.state.lock().expect("bus state poisoned");
        state.cancelled = true;
        state.pending.take();
    }

    /// Clear the sticky cancellation flag (on task resume).
    pub fn reset_cancelled(&self) {
        self.state.lock().expect("bus state poisoned").cancelled = false;
    }
}

impl Default for ApprovalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn tokens_strictly_increase() {
        let bus = ApprovalBus::new();
        let a = bus.next_token();
        let b = bus.next_token();
        let c = bus.next_token();
        assert!(a < b && b < c);
    }

    #[test]
    fn partial_notifies_coalesce_into_one_entry() {
        let bus = ApprovalBus::new();
        bus.notify(NotifyKind::Text, "hel", vec![], true);
        bus.notify(NotifyKind::Text, "hello wor", vec![], true);
        bus.notify(NotifyKind::Text, "hello world", vec![], false);

        let log = bus.snapshot();
        assert_eq!(log.len(), 1);
        match &log[0].payload {
            MessagePayload::Notify { text, partial, .. } => {
                assert_eq!(text, "hello world");
                assert!(!partial);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn different_kind_does_not_coalesce() {
        let bus = ApprovalBus::new();
        bus.notify(NotifyKind::Text, "streaming", vec![], true);
        bus.notify(NotifyKind::Error, "boom", vec![], false);
        assert_eq!(bus.snapshot().len(), 2);
    }

    #[test]
    fn complete_notify_is_never_replaced() {
        let bus = ApprovalBus::new();
        bus.notify(NotifyKind::Text, "first", vec![], false);
        bus.notify(NotifyKind::Text, "second", vec![], true);
        assert_eq!(bus.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn ask_resolves_with_matching_token() {
        let bus = Arc::new(ApprovalBus::new());

        let asker = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.ask(AskKind::Tool, "approve?").await })
        };

        // Wait for the ask to register.
        let token = loop {
            if let Some(t) = bus.pending_token() {
                break t;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        bus.resolve(token, ApprovalResponse::Approved);
        let response = asker.await.unwrap().unwrap();
        assert!(response.is_approved());
    }

    #[tokio::test]
    async fn superseded_ask_aborts_and_stale_token_is_discarded() {
        let bus = Arc::new(ApprovalBus::new());

        let first = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.ask(AskKind::Tool, "first").await })
        };
        let token_a = loop {
            if let Some(t) = bus.pending_token() {
                break t;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let second = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.ask(AskKind::Tool, "second").await })
        };
        let token_b = loop {
            match bus.pending_token() {
                Some(t) if t != token_a => break t,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        };

        // First wait aborted as superseded.
        assert_eq!(first.await.unwrap().unwrap_err(), BusError::Superseded);

        // Resolving A's token must not resolve B's wait.
        bus.resolve(token_a, ApprovalResponse::Approved);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "B's wait must remain pending");

        bus.resolve(token_b, ApprovalResponse::Denied);
        assert_eq!(second.await.unwrap().unwrap(), ApprovalResponse::Denied);
    }

    #[tokio::test]
    async fn cancel_unblocks_inflight_ask() {
        let bus = Arc::new(ApprovalBus::new());
        let asker = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.ask(AskKind::Command, "run it?").await })
        };
        loop {
            if bus.pending_token().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        bus.cancel();
        assert_eq!(asker.await.unwrap().unwrap_err(), BusError::Cancelled);

        // Sticky: new asks fail fast until reset.
        assert_eq!(
            bus.ask(AskKind::Tool, "again?").await.unwrap_err(),
            BusError::Cancelled
        );
        bus.reset_cancelled();
    }

    #[tokio::test]
    async fn final_ask_coalesces_preceding_partial_ask() {
        let bus = Arc::new(ApprovalBus::new());
        bus.ask_partial(AskKind::Tool, "write_to_file (streaming…)");
        bus.ask_partial(AskKind::Tool, "write_to_file a.txt (streaming…)");
        assert_eq!(bus.snapshot().len(), 1);

        let asker = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.ask(AskKind::Tool, "write_to_file a.txt").await })
        };
        let token = loop {
            if let Some(t) = bus.pending_token() {
                break t;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        // Still one log entry: the partial prompt became the final one.
        let log = bus.snapshot();
        assert_eq!(log.len(), 1);
        assert!(!log[0].payload.is_partial());

        bus.resolve(token, ApprovalResponse::Approved);
        asker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn coalescing_emits_replace_with_the_entry_index() {
        let bus = ApprovalBus::new();
        let mut rx = bus.subscribe();

        bus.notify(NotifyKind::Text, "hel", vec![], true);
        bus.notify(NotifyKind::Text, "hello", vec![], false);
        assert!(matches!(rx.recv().await.unwrap(), BusEvent::Appended(_)));
        match rx.recv().await.unwrap() {
            BusEvent::Replaced { index, message } => {
                assert_eq!(index, 0);
                assert!(matches!(
                    message.payload,
                    MessagePayload::Notify { partial: false, .. }
                ));
            }
            other => panic!("unexpected event {other:?}"),
        }

        bus.ask_partial(AskKind::Tool, "write_to_file");
        bus.ask_partial(AskKind::Tool, "write_to_file a.txt");
        assert!(matches!(rx.recv().await.unwrap(), BusEvent::Appended(_)));
        match rx.recv().await.unwrap() {
            BusEvent::Replaced { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let bus = ApprovalBus::new();
        let mut rx = bus.subscribe();
        bus.notify(NotifyKind::Status, "task started", vec![], false);
        match rx.recv().await.unwrap() {
            BusEvent::Appended(msg) => assert!(matches!(
                msg.payload,
                MessagePayload::Notify {
                    kind: NotifyKind::Status,
                    ..
                }
            )),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
