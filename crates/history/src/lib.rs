//! History management — the durable transcript sent to the model.
//!
//! The `HistoryManager` is the only component allowed to mutate a task's
//! history, through exactly two operations: `append` and
//! `truncate_if_over_budget`. Every mutation is checkpointed through the
//! [`Persistence`] collaborator before it takes effect in memory.

mod manager;
mod store;

pub use manager::HistoryManager;
pub use store::{FileStore, NoopStore};
