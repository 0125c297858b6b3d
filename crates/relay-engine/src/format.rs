//! Text rendering for sessions, approvals and notifications.

use std::collections::BTreeMap;

use serde_json::Value;

use relay_core::ids::{RequestId, SessionId};
use relay_core::session::{Message, PendingRequest, RequestSet, Role, Session};

use crate::preview::{extract_preview, truncate, PreviewMode};

const UNTITLED: &str = "(untitled)";
const NO_PATH: &str = "(no path)";
const SHORT_PATH_LIMIT: usize = 40;
const SHORT_PATH_TAIL: usize = 37;
const COMMAND_PREVIEW_LEN: usize = 150;
const ARGS_PREVIEW_LEN: usize = 120;
const LISTING_ARGS_LEN: usize = 80;
const ROUND_PREVIEW_LEN: usize = 500;
const BANNER_BAR: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// `(abcd1234) [claude | ACTIVE | !2 pending] Fix tests`, optionally with `@ path`.
pub fn session_label(session: &Session, current: Option<&SessionId>, show_path: bool) -> String {
    let meta = &session.metadata;
    let mut parts = vec![
        meta.flavor().to_string(),
        if session.active { "ACTIVE" } else { "idle" }.to_string(),
    ];
    if session.pending_requests_count > 0 {
        parts.push(format!("!{} pending", session.pending_requests_count));
    }
    if current == Some(&session.id) {
        parts.push("<<current".to_string());
    }

    let label = format!(
        "({}) [{}] {}",
        session.id.short(),
        parts.join(" | "),
        meta.title().unwrap_or(UNTITLED)
    );
    if show_path {
        format!("{label} @ {}", meta.path().unwrap_or(NO_PATH))
    } else {
        label
    }
}

/// Compact label used in pushed notifications.
///
/// Unknown sessions render as just `[abcd1234]`.
pub fn session_label_short(session_id: &SessionId, sessions: &[Session]) -> String {
    let Some(session) = sessions.iter().find(|s| &s.id == session_id) else {
        return format!("[{}]", session_id.short());
    };
    let meta = &session.metadata;
    let path = meta.path().unwrap_or_default();
    let path = if path.chars().count() > SHORT_PATH_LIMIT {
        let tail: String = path
            .chars()
            .skip(path.chars().count() - SHORT_PATH_TAIL)
            .collect();
        format!("...{tail}")
    } else {
        path.to_string()
    };
    format!(
        "[{} | {} | {}] @ {path}",
        session_id.short(),
        meta.flavor(),
        meta.title().unwrap_or(UNTITLED)
    )
}

/// Tool name plus its most telling argument.
pub fn format_request_detail(request: &PendingRequest) -> String {
    let tool = request.tool_name();
    let args = match &request.arguments {
        Value::Object(map) if !map.is_empty() => map,
        _ => return tool.to_string(),
    };
    if let Some(command) = args.get("command").and_then(Value::as_str) {
        if !command.is_empty() {
            return format!("{tool}: {}", truncate(command, COMMAND_PREVIEW_LEN));
        }
    }
    let json = request.arguments.to_string();
    if json.chars().count() > ARGS_PREVIEW_LEN {
        format!("{tool}: {}...", truncate(&json, ARGS_PREVIEW_LEN))
    } else {
        format!("{tool}: {json}")
    }
}

/// Every pending request in session order, then request-id order.
pub fn flatten_pending(
    pending: &BTreeMap<SessionId, RequestSet>,
) -> Vec<(&SessionId, &RequestId, &PendingRequest)> {
    pending
        .iter()
        .flat_map(|(sid, requests)| requests.iter().map(move |(rid, req)| (sid, rid, req)))
        .collect()
}

pub fn format_pending_requests(
    pending: &BTreeMap<SessionId, RequestSet>,
    sessions: &[Session],
) -> String {
    let items = flatten_pending(pending);
    if items.is_empty() {
        return "No pending approvals".to_string();
    }

    let mut lines = vec![format!("Pending approvals ({}):", items.len())];
    for (i, (sid, _, req)) in items.iter().enumerate() {
        lines.push(format!(
            "[{}] {} {}",
            i + 1,
            session_label_short(sid, sessions),
            req.tool_name()
        ));
        lines.push(format!("    {}", truncate(&req.arguments.to_string(), LISTING_ARGS_LEN)));
    }
    lines.join("\n")
}

/// Numbered session listing grouped by working directory.
pub fn format_session_list(sessions: &[Session], current: Option<&SessionId>) -> String {
    if sessions.is_empty() {
        return "No sessions".to_string();
    }

    let mut groups: Vec<(&str, Vec<&Session>)> = Vec::new();
    for session in sessions {
        let path = session.metadata.path().unwrap_or(NO_PATH);
        match groups.iter_mut().find(|(p, _)| *p == path) {
            Some((_, members)) => members.push(session),
            None => groups.push((path, vec![session])),
        }
    }

    let mut lines = vec![format!("{} sessions:", sessions.len())];
    let mut index = 1;
    for (path, members) in groups {
        lines.push(format!("\n📁 {path}"));
        for session in members {
            lines.push(format!("  [{index}] {}", session_label(session, current, false)));
            index += 1;
        }
    }
    lines.join("\n")
}

pub fn format_session_status(session: &Session) -> String {
    let meta = &session.metadata;
    [
        format!("Session:    {}...", session.id.short()),
        format!("Title:      {}", meta.title().unwrap_or(UNTITLED)),
        format!("Flavor:     {}", meta.flavor()),
        format!("Path:       {}", meta.path().unwrap_or("?")),
        format!("Active:     {}", session.active),
        format!("Thinking:   {}", session.thinking),
        format!(
            "Permission: {}",
            session.permission_mode.as_deref().unwrap_or("default")
        ),
        format!("Model:      {}", session.model_mode.as_deref().unwrap_or("default")),
    ]
    .join("\n")
}

/// One `[ seq] role: preview` line per displayable message.
pub fn format_messages(messages: &[Message], max_preview: usize) -> String {
    if messages.is_empty() {
        return "(no messages)".to_string();
    }
    let lines: Vec<String> = messages
        .iter()
        .filter_map(|m| {
            let text = extract_preview(&m.content, max_preview, PreviewMode::Feed)?;
            Some(format!("[{:>4}] {}: {text}", m.seq, m.role_tag().unwrap_or("?")))
        })
        .collect();
    if lines.is_empty() {
        "(no displayable messages)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Split a message log into rounds; each user message opens a new round.
pub fn split_into_rounds(messages: &[Message]) -> Vec<&[Message]> {
    let mut rounds = Vec::new();
    let mut start = 0;
    for (i, message) in messages.iter().enumerate() {
        if message.role() == Role::User && i > start {
            rounds.push(&messages[start..i]);
            start = i;
        }
    }
    if start < messages.len() {
        rounds.push(&messages[start..]);
    }
    rounds
}

pub fn format_round(round: &[Message], index: usize, total: usize) -> String {
    let mut lines = vec![format!("── Round {index}/{total} ──")];
    for message in round {
        let Some(text) = extract_preview(&message.content, ROUND_PREVIEW_LEN, PreviewMode::Grouped)
        else {
            continue;
        };
        let speaker = match message.role() {
            Role::User => "User",
            Role::Agent => "Agent",
            Role::Other => "System",
        };
        lines.push(format!("[{speaker}]: {text}"));
    }
    if lines.len() == 1 {
        lines.push("(nothing to show)".to_string());
    }
    lines.join("\n")
}

/// Plain agent text gets a `[Message]` tag; tool lines already carry one.
pub fn format_agent_line(text: &str) -> String {
    if text.starts_with('[') {
        text.to_string()
    } else {
        format!("[Message]: {text}")
    }
}

pub fn approval_notice(label: &str, detail: &str, total_pending: usize) -> String {
    [
        format!("⚠ Approval needed {label}"),
        format!("  {detail}"),
        String::new(),
        format!("{total_pending} request(s) awaiting approval"),
    ]
    .join("\n")
}

pub fn completion_notice(label: &str) -> String {
    format!("✅ task completed, awaiting input {label}")
}

/// One line inline under the label; several inside a banner.
pub fn message_notice(label: &str, lines: &[String]) -> String {
    if let [only] = lines {
        return format!("{label}\n{only}");
    }
    let mut parts = Vec::with_capacity(lines.len() + 2);
    parts.push(format!("━━━ {label} · {} new messages ━━━", lines.len()));
    parts.extend(lines.iter().cloned());
    parts.push(BANNER_BAR.to_string());
    parts.join("\n\n")
}
