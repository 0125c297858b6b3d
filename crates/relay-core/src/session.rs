use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ids::{RequestId, SessionId};

/// Presence-aware value for partial updates.
///
/// `Absent` means the key was not in the payload (leave the field alone),
/// `Cleared` means it was present as `null`.
#[derive(Clone, Debug, PartialEq)]
pub enum Field<T> {
    Absent,
    Cleared,
    Set(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Absent
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Field::Set(value),
            None => Field::Cleared,
        })
    }
}

impl<T> Field<T> {
    pub fn is_present(&self) -> bool {
        !matches!(self, Field::Absent)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Set(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: Clone> Field<T> {
    /// Resolve against the prior value: absent keeps `prior`, null yields `cleared`.
    pub fn resolve(&self, prior: T, cleared: T) -> T {
        match self {
            Field::Absent => prior,
            Field::Cleared => cleared,
            Field::Set(v) => v.clone(),
        }
    }
}

/// One tool use waiting for a human decision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingRequest {
    pub tool: String,
    pub arguments: Value,
}

impl PendingRequest {
    pub fn tool_name(&self) -> &str {
        if self.tool.is_empty() {
            "?"
        } else {
            &self.tool
        }
    }
}

pub type RequestSet = BTreeMap<RequestId, PendingRequest>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    pub requests: Option<RequestSet>,
}

impl AgentState {
    /// The embedded request set; `null` and missing both mean "none pending".
    pub fn requests(&self) -> RequestSet {
        self.requests.clone().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Summary {
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    pub path: Option<String>,
    pub flavor: Option<String>,
    pub summary: Option<Summary>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionMetadata {
    pub fn flavor(&self) -> &str {
        self.flavor.as_deref().filter(|f| !f.is_empty()).unwrap_or("?")
    }

    pub fn title(&self) -> Option<&str> {
        self.summary
            .as_ref()
            .map(|s| s.text.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref().filter(|p| !p.is_empty())
    }

    /// Shallow key merge: keys in `patch` overwrite, everything else stays.
    pub fn merge(&mut self, patch: &Map<String, Value>) -> Result<(), serde_json::Error> {
        let mut current = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            current.insert(key.clone(), value.clone());
        }
        *self = serde_json::from_value(Value::Object(current))?;
        Ok(())
    }
}

/// A remote agent session as listed by the API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Session {
    pub id: SessionId,
    pub active: bool,
    pub thinking: bool,
    pub metadata: SessionMetadata,
    pub pending_requests_count: u32,
    pub permission_mode: Option<String>,
    pub model_mode: Option<String>,
    pub agent_state: Option<AgentState>,
}

impl Session {
    /// Apply an event patch field by field.
    pub fn apply(&mut self, patch: &SessionPatch) -> Result<(), serde_json::Error> {
        self.active = patch.active.resolve(self.active, false);
        self.thinking = patch.thinking.resolve(self.thinking, false);
        self.pending_requests_count = patch
            .pending_requests_count
            .resolve(self.pending_requests_count, 0);
        match &patch.agent_state {
            Field::Absent => {}
            Field::Cleared => self.agent_state = None,
            Field::Set(state) => self.agent_state = Some(state.clone()),
        }
        match &patch.metadata {
            Field::Absent => Ok(()),
            Field::Cleared => {
                self.metadata = SessionMetadata::default();
                Ok(())
            }
            Field::Set(map) => self.metadata.merge(map),
        }
    }
}

/// Partial session update carried by a `session-updated` event.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPatch {
    pub active: Field<bool>,
    pub thinking: Field<bool>,
    pub metadata: Field<Map<String, Value>>,
    pub pending_requests_count: Field<u32>,
    pub agent_state: Field<AgentState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Agent,
    Other,
}

impl Role {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "user" => Role::User,
            "agent" | "assistant" => Role::Agent,
            _ => Role::Other,
        }
    }
}

/// One entry of a session's append-only message log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub seq: u64,
    /// `{role, content}` envelope; the inner shape depends on the agent flavor.
    pub content: Value,
}

impl Message {
    pub fn role_tag(&self) -> Option<&str> {
        self.content.get("role").and_then(Value::as_str)
    }

    pub fn role(&self) -> Role {
        self.role_tag().map(Role::from_tag).unwrap_or(Role::Other)
    }
}

/// A decoded SSE frame.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "session-updated", rename_all = "camelCase")]
    SessionUpdated {
        session_id: SessionId,
        #[serde(default)]
        data: SessionPatch,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(value: Value) -> SessionPatch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn field_distinguishes_absent_null_and_value() {
        let p = patch(json!({"active": false, "thinking": null}));
        assert_eq!(p.active, Field::Set(false));
        assert_eq!(p.thinking, Field::Cleared);
        assert_eq!(p.pending_requests_count, Field::Absent);
        assert!(!p.metadata.is_present());
    }

    #[test]
    fn false_is_an_update_not_an_absence() {
        let mut s = Session { active: true, thinking: true, ..Default::default() };
        s.apply(&patch(json!({"thinking": false}))).unwrap();
        assert!(s.active);
        assert!(!s.thinking);
    }

    #[test]
    fn null_clears_flags_and_counts() {
        let mut s = Session { active: true, pending_requests_count: 3, ..Default::default() };
        s.apply(&patch(json!({"active": null, "pendingRequestsCount": null}))).unwrap();
        assert!(!s.active);
        assert_eq!(s.pending_requests_count, 0);
    }

    #[test]
    fn metadata_keys_merge() {
        let mut s: Session = serde_json::from_value(json!({
            "id": "s1",
            "metadata": {"path": "/repo", "flavor": "claude", "host": "box"}
        }))
        .unwrap();
        s.apply(&patch(json!({"metadata": {"summary": {"text": "Fix tests"}}}))).unwrap();
        assert_eq!(s.metadata.path(), Some("/repo"));
        assert_eq!(s.metadata.flavor(), "claude");
        assert_eq!(s.metadata.title(), Some("Fix tests"));
        assert_eq!(s.metadata.extra["host"], "box");
    }

    #[test]
    fn malformed_metadata_patch_keeps_previous() {
        let mut s: Session = serde_json::from_value(json!({
            "id": "s1", "metadata": {"path": "/repo"}
        }))
        .unwrap();
        let result = s.apply(&patch(json!({"metadata": {"summary": 42}})));
        assert!(result.is_err());
        assert_eq!(s.metadata.path(), Some("/repo"));
    }

    #[test]
    fn agent_state_requests_default_to_empty() {
        let state: AgentState = serde_json::from_value(json!({"requests": null})).unwrap();
        assert!(state.requests().is_empty());

        let state: AgentState = serde_json::from_value(json!({
            "requests": {"r1": {"tool": "Bash", "arguments": {"command": "ls"}}}
        }))
        .unwrap();
        let requests = state.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[&RequestId::from("r1")].tool, "Bash");
    }

    #[test]
    fn decode_session_updated_event() {
        let evt: SessionEvent = serde_json::from_str(
            r#"{"type":"session-updated","sessionId":"abc","data":{"active":true,"agentState":{"requests":{}}}}"#,
        )
        .unwrap();
        match evt {
            SessionEvent::SessionUpdated { session_id, data } => {
                assert_eq!(session_id.as_str(), "abc");
                assert_eq!(data.active, Field::Set(true));
                assert!(data.agent_state.value().unwrap().requests().is_empty());
            }
            SessionEvent::Other => panic!("expected SessionUpdated"),
        }
    }

    #[test]
    fn decode_unknown_event_kind() {
        let evt: SessionEvent =
            serde_json::from_str(r#"{"type":"machine-updated","machineId":"m1"}"#).unwrap();
        assert!(matches!(evt, SessionEvent::Other));
    }

    #[test]
    fn message_roles() {
        let user = Message { seq: 1, content: json!({"role": "user", "content": "hi"}) };
        let agent = Message { seq: 2, content: json!({"role": "agent", "content": {}}) };
        let bare = Message { seq: 3, content: json!("text") };
        assert_eq!(user.role(), Role::User);
        assert_eq!(agent.role(), Role::Agent);
        assert_eq!(bare.role(), Role::Other);
    }

    #[test]
    fn unknown_tool_name_renders_placeholder() {
        assert_eq!(PendingRequest::default().tool_name(), "?");
    }
}
