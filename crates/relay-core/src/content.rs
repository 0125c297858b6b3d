use serde_json::{Map, Value};

/// Closed view over a loosely-typed message payload.
///
/// Agent flavors nest content differently (bare strings, block lists,
/// provider envelopes). Classification happens once here; anything that
/// does not match a known shape lands in [`Block::Other`] with the raw map.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    Empty,
    Text(String),
    Scalar(Value),
    List(Vec<Content>),
    Block(Block),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Text { text: String },
    ToolCall { name: String, input: Value },
    ToolResult { output: Value },
    /// One level of provider wrapping (`output`, `input`, `codex`).
    Wrapper { inner: Box<Content> },
    Event { subtype: String },
    Noise { subtype: String },
    /// `{role, content}` either inline or under a `message` key.
    Envelope { role: Option<String>, content: Box<Content> },
    /// Codex conversational text: `{type: "message", message: "..."}`.
    AgentMessage { message: String },
    Other { tag: Option<String>, raw: Map<String, Value> },
}

const NOISE_TYPES: &[&str] = &["token_count", "thinking"];

impl Content {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Content::Empty,
            Value::String(s) => Content::Text(s.clone()),
            Value::Array(items) => Content::List(items.iter().map(Content::from_value).collect()),
            Value::Object(map) => Content::Block(Block::from_map(map)),
            other => Content::Scalar(other.clone()),
        }
    }
}

impl Block {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let tag = map.get("type").and_then(Value::as_str);
        match tag {
            Some("text") => Block::Text {
                text: str_field(map, "text").unwrap_or_default().to_string(),
            },
            Some("tool-call" | "tool_call" | "tool_use") => {
                let input = map
                    .get("input")
                    .or_else(|| map.get("arguments"))
                    .cloned()
                    .unwrap_or(Value::Null);
                // Codex reports the real tool inside the input.
                let name = input
                    .get("tool")
                    .and_then(Value::as_str)
                    .or_else(|| str_field(map, "name"))
                    .unwrap_or("?")
                    .to_string();
                Block::ToolCall { name, input }
            }
            Some("tool-result" | "tool_result" | "tool-call-result" | "tool_call_result") => {
                Block::ToolResult {
                    output: map
                        .get("output")
                        .or_else(|| map.get("content"))
                        .cloned()
                        .unwrap_or(Value::Null),
                }
            }
            Some("output" | "input" | "codex") => {
                let inner = map
                    .get("data")
                    .or_else(|| map.get("content"))
                    .or_else(|| map.get("message"))
                    .unwrap_or(&Value::Null);
                Block::Wrapper { inner: Box::new(Content::from_value(inner)) }
            }
            Some("event") => Block::Event {
                subtype: map
                    .get("data")
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string(),
            },
            Some(t) if NOISE_TYPES.contains(&t) => Block::Noise { subtype: t.to_string() },
            Some("message") if map.get("message").is_some_and(Value::is_string) => {
                Block::AgentMessage {
                    message: str_field(map, "message").unwrap_or_default().to_string(),
                }
            }
            _ => Self::classify_untyped(tag, map),
        }
    }

    fn classify_untyped(tag: Option<&str>, map: &Map<String, Value>) -> Self {
        if map.contains_key("role") && map.contains_key("content") {
            return Block::Envelope {
                role: str_field(map, "role").map(str::to_string),
                content: Box::new(Content::from_value(&map["content"])),
            };
        }
        if let Some(Value::Object(inner)) = map.get("message") {
            if let Some(content) = inner.get("content") {
                return Block::Envelope {
                    role: str_field(inner, "role").map(str::to_string),
                    content: Box::new(Content::from_value(content)),
                };
            }
        }
        if tag.is_none() {
            if let Some(text) = str_field(map, "text") {
                return Block::Text { text: text.to_string() };
            }
        }
        Block::Other {
            tag: tag.map(str::to_string),
            raw: map.clone(),
        }
    }
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}
