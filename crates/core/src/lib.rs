//! # Coxswain Core
//!
//! Domain types, traits, and error definitions for the Coxswain agent
//! control core. This crate has **zero framework dependencies** — it
//! defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem boundary is a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod approval;
pub mod block;
pub mod error;
pub mod persist;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use approval::{ApprovalResponse, AskKind, MessagePayload, NotifyKind, OperatorMessage};
pub use block::{ContentBlock, ImageData, TaskId, TaskStatus, ToolParams, TurnRecord, Usage};
pub use error::{
    BusError, Error, HistoryError, PersistError, ProviderError, Result, TaskError, ToolError,
};
pub use persist::Persistence;
pub use provider::{ProviderClient, StreamEvent};
pub use tool::{OutputFeed, Tool, ToolOutcome, ToolRegistry};
