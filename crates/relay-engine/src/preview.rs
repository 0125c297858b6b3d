//! Human-readable previews of message payloads.
//!
//! Payloads are classified once into [`Content`] and rendered here. A
//! rendering of `None` means the payload is noise (token counters, ready
//! events, empty blocks) and should not be shown at all.

use serde_json::{Map, Value};

use relay_core::content::{Block, Content};

/// Fields probed, in order, on blocks of an unknown type.
const PROBE_FIELDS: &[&str] = &["text", "data", "content", "message", "output"];

/// How many stdout lines a tool result shows in the feed.
const RESULT_STDOUT_LINES: usize = 3;

/// Which view the preview is rendered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviewMode {
    /// Low-level event feed: tool results are shown with their exit code.
    Feed,
    /// Round-based view: tool results are suppressed.
    Grouped,
}

/// Render a message payload, or `None` when there is nothing worth showing.
///
/// `max_len` counts characters; `0` disables truncation.
pub fn extract_preview(content: &Value, max_len: usize, mode: PreviewMode) -> Option<String> {
    render(&Content::from_value(content), max_len, mode)
}

fn render(content: &Content, max_len: usize, mode: PreviewMode) -> Option<String> {
    match content {
        Content::Empty => None,
        Content::Text(s) if s.is_empty() => None,
        Content::Text(s) => Some(truncate(s, max_len)),
        Content::Scalar(v) => Some(truncate(&v.to_string(), max_len)),
        Content::List(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|item| render(item, max_len, mode))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        Content::Block(block) => render_block(block, max_len, mode),
    }
}

fn render_block(block: &Block, max_len: usize, mode: PreviewMode) -> Option<String> {
    match block {
        Block::Text { text } if text.trim().is_empty() => None,
        Block::Text { text } => Some(truncate(text, max_len)),
        Block::ToolCall { name, input } => {
            let args = command_of(input).unwrap_or_else(|| input.to_string());
            Some(format!("[call {name}] {}", truncate(&args, max_len)))
        }
        Block::ToolResult { output } => match mode {
            PreviewMode::Grouped => None,
            PreviewMode::Feed => Some(render_result(output, max_len)),
        },
        Block::Wrapper { inner } => render(inner, max_len, mode),
        Block::Event { subtype } if subtype == "ready" => None,
        Block::Event { subtype } => Some(format!("[event: {subtype}]")),
        Block::Noise { .. } => None,
        Block::Envelope { content, .. } => render(content, max_len, mode),
        Block::AgentMessage { message } if message.is_empty() => Some("[message]".to_string()),
        Block::AgentMessage { message } => Some(truncate(message, max_len)),
        Block::Other { tag, raw } => render_unknown(tag.as_deref(), raw, max_len, mode),
    }
}

/// A tool call's command line, if it has one. Codex sends argv arrays.
fn command_of(input: &Value) -> Option<String> {
    match input.get("command")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(argv) if !argv.is_empty() => Some(
            argv.iter()
                .map(|a| a.as_str().map(str::to_string).unwrap_or_else(|| a.to_string()))
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

fn render_result(output: &Value, max_len: usize) -> String {
    let Value::Object(out) = output else {
        let text = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return format!("[result] {}", truncate(&text, max_len));
    };

    let exit = match out.get("exit_code").or_else(|| out.get("exitCode")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "?".to_string(),
        Some(v) => v.to_string(),
    };
    let stdout = out.get("stdout").and_then(Value::as_str).unwrap_or_default();
    if !stdout.is_empty() {
        let head: Vec<&str> = stdout.lines().take(RESULT_STDOUT_LINES).collect();
        return format!("[result exit={exit}] {}", truncate(&head.join("\n"), max_len));
    }
    if out.contains_key("command") {
        let status = out.get("status").and_then(Value::as_str).unwrap_or_default();
        return format!("[result exit={exit}] {status}");
    }
    format!("[result] {}", truncate(&output.to_string(), max_len))
}

fn render_unknown(
    tag: Option<&str>,
    raw: &Map<String, Value>,
    max_len: usize,
    mode: PreviewMode,
) -> Option<String> {
    for field in PROBE_FIELDS {
        match raw.get(*field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {
                let body = truncate(s, max_len);
                return Some(match tag {
                    Some(tag) => format!("[{tag}] {body}"),
                    None => body,
                });
            }
            Some(nested @ (Value::Array(_) | Value::Object(_))) => {
                if let Some(text) = render(&Content::from_value(nested), max_len, mode) {
                    return Some(text);
                }
            }
            _ => {}
        }
    }
    if raw.is_empty() {
        return None;
    }
    let json = serde_json::to_string(raw).unwrap_or_default();
    Some(truncate(&json, max_len))
}

/// Keep at most `max_len` characters; `0` keeps everything.
pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if max_len == 0 {
        return s.to_string();
    }
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
