//! Streaming content-block parser.
//!
//! Converts the raw text accumulated so far in one assistant turn into an
//! ordered sequence of typed [`ContentBlock`]s. The parse is a pure
//! function of the buffer: it is re-run from scratch on every stream
//! chunk, which keeps partial blocks consistent even when they are
//! rewritten in place.
//!
//! Grammar (informal):
//! ```text
//! turn      = (text | tool_use)*
//! tool_use  = "<" TOOL_NAME ">" (param | junk)* "</" TOOL_NAME ">"
//! param     = "<" IDENT ">" value "</" IDENT ">"
//! ```
//! Only registered tool names open a `tool_use`; any other tag is literal
//! text, tolerating model formatting noise. A block that runs to
//! end-of-buffer is `partial = true` — the presenter clears partial flags
//! once the stream finishes.

use coxswain_core::block::{ContentBlock, ToolParams};

/// Parse the full raw buffer into an ordered block sequence.
///
/// `tool_names` is the set of tag names that open a `ToolUse` block.
pub fn parse_blocks(buffer: &str, tool_names: &[&str]) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    let mut text_start = 0usize;
    let mut i = 0usize;
    let bytes = buffer.as_bytes();

    while i < bytes.len() {
        if bytes[i] == b'<' {
            if let Some((name, open_len)) = match_open_tag(&buffer[i..], tool_names) {
                push_text(&mut blocks, &buffer[text_start..i], false);

                let body = &buffer[i + open_len..];
                let (params, consumed, closed) = parse_tool_body(name, body);
                blocks.push(ContentBlock::ToolUse {
                    name: name.to_string(),
                    params,
                    partial: !closed,
                });

                i += open_len + consumed;
                text_start = i;
                continue;
            }
        }
        i += utf8_len(bytes[i]);
    }

    push_text(&mut blocks, &buffer[text_start..], true);
    blocks
}

/// Minimal length of the char starting at this byte.
fn utf8_len(b: u8) -> usize {
    match b {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        b if b >= 0xC0 => 2,
        _ => 1,
    }
}

fn push_text(blocks: &mut Vec<ContentBlock>, segment: &str, partial: bool) {
    let trimmed = segment.trim();
    if !trimmed.is_empty() {
        blocks.push(ContentBlock::Text {
            content: trimmed.to_string(),
            partial,
        });
    }
}

/// Match `<name>` at the start of `rest` against the registered tool names.
fn match_open_tag<'a>(rest: &str, tool_names: &[&'a str]) -> Option<(&'a str, usize)> {
    for name in tool_names {
        // "<name>"
        if rest.len() > name.len() + 1
            && rest.as_bytes()[0] == b'<'
            && rest[1..].starts_with(name)
            && rest.as_bytes()[name.len() + 1] == b'>'
        {
            return Some((name, name.len() + 2));
        }
    }
    None
}

/// Parse the body of a tool block, returning the parameter map, bytes
/// consumed, and whether the closing tag arrived.
///
/// Only parameters whose closing tag has been seen make it into the map;
/// an unclosed parameter leaves the block partial with whatever closed
/// before it.
fn parse_tool_body(name: &str, body: &str) -> (ToolParams, usize, bool) {
    let close_tag = format!("</{name}>");
    let mut params = ToolParams::new();
    let mut pos = 0usize;

    loop {
        let Some(rel) = body[pos..].find('<') else {
            return (params, body.len(), false);
        };
        let p = pos + rel;

        if body[p..].starts_with(&close_tag) {
            return (params, p + close_tag.len(), true);
        }

        match match_param_tag(&body[p..]) {
            ParamTag::Open(pname) => {
                let value_start = p + pname.len() + 2;
                let param_close = format!("</{pname}>");
                match body[value_start..].find(&param_close) {
                    Some(rel_close) => {
                        let value = &body[value_start..value_start + rel_close];
                        params.insert(pname.to_string(), value.trim().to_string());
                        pos = value_start + rel_close + param_close.len();
                    }
                    // Parameter still streaming in.
                    None => return (params, body.len(), false),
                }
            }
            ParamTag::Truncated => return (params, body.len(), false),
            ParamTag::NotATag => pos = p + 1,
        }
    }
}

enum ParamTag<'a> {
    /// A well-formed `<ident>` open tag.
    Open(&'a str),
    /// A `<` whose tag name runs past end-of-buffer.
    Truncated,
    /// A `<` that is not an identifier tag at all.
    NotATag,
}

/// Classify a `<...` sequence inside a tool body.
fn match_param_tag(rest: &str) -> ParamTag<'_> {
    debug_assert!(rest.starts_with('<'));
    let inner = &rest[1..];
    for (idx, ch) in inner.char_indices() {
        if ch == '>' {
            if idx == 0 {
                return ParamTag::NotATag;
            }
            return ParamTag::Open(&inner[..idx]);
        }
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            return ParamTag::NotATag;
        }
    }
    if inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        ParamTag::Truncated
    } else {
        ParamTag::NotATag
    }
}

/// Remove `<thinking>…</thinking>` spans, including an unclosed trailing
/// span, so internal reasoning never renders to the operator.
pub fn strip_reasoning(text: &str) -> String {
    const OPEN: &str = "<thinking>";
    const CLOSE: &str = "</thinking>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        match rest[start + OPEN.len()..].find(CLOSE) {
            Some(end) => rest = &rest[start + OPEN.len() + end + CLOSE.len()..],
            None => return out.trim().to_string(),
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Trim a dangling tag fragment from the buffer tail: a final `<` that
/// never saw its `>` must not render to the operator.
pub fn trim_dangling_tag(text: &str) -> &str {
    let Some(last_open) = text.rfind('<') else {
        return text;
    };
    let tail = &text[last_open..];
    if tail.contains('>') {
        return text;
    }
    if tail[1..]
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/')
    {
        text[..last_open].trim_end()
    } else {
        text
    }
}
