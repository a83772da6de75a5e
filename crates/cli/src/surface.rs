//! Terminal approval surface.
//!
//! Renders the operator message log to stdout and feeds stdin lines back
//! as approval responses. Partial revisions are skipped; a message is
//! printed once, when its final revision lands.

use std::sync::Arc;

use coxswain_bus::{ApprovalBus, BusEvent};
use coxswain_core::approval::{ApprovalResponse, AskKind, MessagePayload, NotifyKind, OperatorMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Start the surface: one task rendering bus events, one reading stdin.
/// Both run until the bus (and the task loop holding it) is dropped.
pub fn spawn(bus: Arc<ApprovalBus>) -> JoinHandle<()> {
    let responder_bus = Arc::clone(&bus);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(token) = responder_bus.pending_token() else {
                continue;
            };
            responder_bus.resolve(token, parse_response(line.trim()));
        }
    });

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BusEvent::Appended(message)) => render(&message),
                Ok(BusEvent::Replaced { message, .. }) => render(&message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("(surface lagged, {skipped} messages dropped)");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn parse_response(line: &str) -> ApprovalResponse {
    match line.to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalResponse::Approved,
        "n" | "no" => ApprovalResponse::Denied,
        _ => ApprovalResponse::Feedback {
            text: line.to_string(),
            images: Vec::new(),
        },
    }
}

fn render(message: &OperatorMessage) {
    if message.payload.is_partial() {
        return;
    }
    match &message.payload {
        MessagePayload::Notify {
            kind, text, images, ..
        } => {
            let prefix = match kind {
                NotifyKind::Text => "claude",
                NotifyKind::Error => "error",
                NotifyKind::ToolResult => "tool",
                NotifyKind::CommandOutput => "output",
                NotifyKind::Status => "status",
            };
            println!("[{prefix}] {text}");
            if !images.is_empty() {
                println!("[{prefix}] ({} image(s) attached)", images.len());
            }
        }
        MessagePayload::Ask { kind, text, .. } => {
            println!("[ask] {text}");
            match kind {
                AskKind::Followup => println!("  (type your answer)"),
                AskKind::Completion => {
                    println!("  (y to accept, or type feedback to continue the task)")
                }
                _ => println!("  (y to approve, n to deny, or type feedback)"),
            }
        }
    }
}
