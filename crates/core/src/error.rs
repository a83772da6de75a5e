//! Error types for the Coxswain domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Coxswain operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Bus errors ---
    #[error("Approval bus error: {0}")]
    Bus(#[from] BusError),

    // --- History errors ---
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Persistence errors ---
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    // --- Task lifecycle errors ---
    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Errors from the approval/notification bus.
///
/// `Superseded` and `Cancelled` are not failures in the usual sense: they
/// are the two ways a blocking ask can unblock without a human response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Approval request superseded by a newer request")]
    Superseded,

    #[error("Approval request cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Record breaks user/assistant alternation: expected {expected} record")]
    BrokenAlternation { expected: &'static str },

    #[error("Persistence failed during truncation, history unchanged: {0}")]
    TruncatePersist(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Checkpoint not found for task {0}")]
    NotFound(String),

    #[error("Corrupted checkpoint: {0}")]
    Corrupted(String),
}

/// Fatal task-construction errors. Raised before any turn begins.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("A task with id {0} already exists")]
    DuplicateTask(String),

    #[error("Missing required construction argument: {0}")]
    MissingArgument(&'static str),
}
