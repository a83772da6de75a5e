//! Built-in tool implementations for Coxswain.
//!
//! Every tool resolves model-supplied paths against a working-directory
//! root and refuses to escape it. Execution failures come back as error
//! `ToolOutcome`s (so the model can react), never as panics.

mod execute_command;
mod files;
mod interaction;

pub use execute_command::ExecuteCommandTool;
pub use files::{ListFilesTool, ReadFileTool, WriteToFileTool};
pub use interaction::{AskFollowupTool, AttemptCompletionTool};

use coxswain_core::tool::ToolRegistry;
use std::path::{Component, Path, PathBuf};

/// Tag name of the designated completion tool.
pub const COMPLETION_TOOL: &str = "attempt_completion";

/// Tag name of the shell execution tool.
pub const EXECUTE_COMMAND_TOOL: &str = "execute_command";

/// Tag name of the operator follow-up question tool.
pub const FOLLOWUP_TOOL: &str = "ask_followup_question";

/// Build a registry with the full built-in tool set rooted at `workdir`.
pub fn default_registry(workdir: impl Into<PathBuf>) -> ToolRegistry {
    let workdir = workdir.into();
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(ReadFileTool::new(workdir.clone())));
    registry.register(Box::new(WriteToFileTool::new(workdir.clone())));
    registry.register(Box::new(ListFilesTool::new(workdir.clone())));
    registry.register(Box::new(ExecuteCommandTool::new(workdir)));
    registry.register(Box::new(AskFollowupTool));
    registry.register(Box::new(AttemptCompletionTool));
    registry
}

/// Resolve `requested` against `root` without letting `..` components
/// escape it. Returns the resolved path or the offending input.
pub(crate) fn resolve_within(root: &Path, requested: &str) -> Result<PathBuf, String> {
    let requested_path = Path::new(requested);
    let mut resolved = if requested_path.is_absolute() {
        // Absolute paths are allowed only if they already sit under root.
        requested_path.to_path_buf()
    } else {
        root.join(requested_path)
    };

    let mut normalized = PathBuf::new();
    for component in resolved.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(format!("path escapes working directory: {requested}"));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    resolved = normalized;

    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(format!("path escapes working directory: {requested}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_under_root() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_within(root, "src/main.rs").unwrap(),
            PathBuf::from("/work/src/main.rs")
        );
    }

    #[test]
    fn parent_escapes_are_rejected() {
        let root = Path::new("/work");
        assert!(resolve_within(root, "../etc/passwd").is_err());
        assert!(resolve_within(root, "a/../../etc").is_err());
        // Dotted traversal that stays inside is fine.
        assert!(resolve_within(root, "a/../b.txt").is_ok());
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let root = Path::new("/work");
        assert!(resolve_within(root, "/etc/passwd").is_err());
        assert!(resolve_within(root, "/work/ok.txt").is_ok());
    }

    #[test]
    fn default_registry_has_all_builtins() {
        let registry = default_registry("/tmp");
        let names = registry.names();
        for expected in [
            "ask_followup_question",
            "attempt_completion",
            "execute_command",
            "list_files",
            "read_file",
            "write_to_file",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
    }
}
