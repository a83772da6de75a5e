//! Task orchestration for coxswain.
//!
//! Two pieces live here. [`TurnPresenter`] walks the content blocks of a
//! single assistant turn as they stream in, pushing text to the operator
//! bus and gating tool invocations behind approval. [`TaskLoop`] drives
//! whole tasks: it calls the provider, feeds the presenter, records the
//! conversation, and decides when a task is done.

mod presenter;
mod prompt;
mod task;

pub use presenter::{PresenterPolicy, TurnPresenter};
pub use prompt::build_system_prompt;
pub use task::{AbortHandle, TaskLoop, TaskOptions, TaskReport};
