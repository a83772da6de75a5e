//! System prompt assembly.

use std::path::Path;

use coxswain_core::tool::ToolRegistry;
use coxswain_tools::{COMPLETION_TOOL, FOLLOWUP_TOOL};

/// Builds the system prompt for a task: the tool-call protocol, the
/// documentation for every registered tool, and any operator-supplied
/// custom instructions.
pub fn build_system_prompt(
    registry: &ToolRegistry,
    workdir: &Path,
    custom_instructions: Option<&str>,
) -> String {
    let mut out = String::with_capacity(4096);

    out.push_str(
        "You are a capable software assistant that accomplishes tasks by \
         using tools, one step at a time.\n\n\
         ====\n\nTOOL USE\n\n\
         Tools are invoked with XML-style tags. The tool name becomes the \
         outer tag and each parameter is a nested tag:\n\n\
         <tool_name>\n<param_name>value</param_name>\n</tool_name>\n\n\
         Rules:\n\
         - Use exactly ONE tool per message. After each tool use, wait for \
         the result before deciding on the next step.\n\
         - Tool results, including errors and user feedback, arrive in the \
         next user message.\n",
    );
    out.push_str(&format!(
        "- When the task is complete, use the {COMPLETION_TOOL} tool to \
         present the final result.\n\
         - If you need information only the user can provide, use the \
         {FOLLOWUP_TOOL} tool.\n\n\
         ====\n\nAVAILABLE TOOLS\n\n"
    ));

    for name in registry.names() {
        if let Some(tool) = registry.get(name) {
            out.push_str(&format!("## {}\n{}\n", tool.name(), tool.description()));
            let required = tool.required_params();
            if required.is_empty() {
                out.push_str("Parameters: none\n\n");
            } else {
                out.push_str("Required parameters: ");
                out.push_str(&required.join(", "));
                out.push_str("\n\n");
            }
        }
    }

    out.push_str(&format!(
        "====\n\nENVIRONMENT\n\nWorking directory: {}\n\
         Relative paths in tool parameters are resolved against the working \
         directory.\n",
        workdir.display()
    ));

    if let Some(extra) = custom_instructions {
        let extra = extra.trim();
        if !extra.is_empty() {
            out.push_str("\n====\n\nCUSTOM INSTRUCTIONS\n\n");
            out.push_str(extra);
            out.push('\n');
        }
    }

    out
}
