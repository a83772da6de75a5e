//! Provider client trait — the boundary to the language model backend.
//!
//! A provider turns a system prompt plus history into a lazily consumed
//! stream of events: text chunks interleaved with usage totals. The stream
//! is finite and terminates normally or with a transport error.

use crate::block::{TurnRecord, Usage};
use crate::error::ProviderError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One event of a streamed model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of raw assistant text.
    Text { content: String },

    /// Token usage totals. May arrive more than once; callers accumulate.
    Usage(Usage),
}

/// The core provider trait.
///
/// The agent loop calls `stream_turn` without knowing which backend is in
/// use. Tests substitute a scripted mock.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic").
    fn name(&self) -> &str;

    /// The context window of the configured model, in tokens.
    fn context_window(&self) -> u64 {
        200_000
    }

    /// Start one model turn.
    ///
    /// Returns a receiver of stream events. Dropping the receiver cancels
    /// the underlying request.
    async fn stream_turn(
        &self,
        system_prompt: &str,
        history: &[TurnRecord],
    ) -> std::result::Result<
        mpsc::Receiver<std::result::Result<StreamEvent, ProviderError>>,
        ProviderError,
    >;
}
