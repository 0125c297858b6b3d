use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use relay_core::api::{EventByteStream, HapiApi};
use relay_core::errors::RelayError;
use relay_core::ids::{MachineId, RequestId, SessionId};
use relay_core::session::{Message, Session};

use crate::transport::{check_status, HapiClient};

/// A host that can spawn new sessions.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Machine {
    pub id: MachineId,
    pub active: bool,
    pub metadata: Map<String, Value>,
}

impl Machine {
    pub fn display_name(&self) -> &str {
        ["displayName", "host"]
            .iter()
            .find_map(|key| self.metadata.get(*key).and_then(Value::as_str))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.id.short())
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub directory: String,
    pub agent: String,
    pub session_type: String,
    pub yolo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_name: Option<String>,
}

impl SpawnRequest {
    pub fn new(directory: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            agent: agent.into(),
            session_type: "simple".to_string(),
            yolo: false,
            worktree_name: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpawnOutcome {
    Success { session_id: SessionId },
    Failed { message: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnResponse {
    #[serde(rename = "type", default)]
    kind: String,
    session_id: Option<SessionId>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct SessionsEnvelope {
    #[serde(default)]
    sessions: Vec<Session>,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct MachinesEnvelope {
    #[serde(default)]
    machines: Vec<Machine>,
}

fn session_path(session_id: &SessionId) -> String {
    format!("/api/sessions/{session_id}")
}

impl HapiClient {
    pub async fn fetch_sessions(&self) -> Result<Vec<Session>, RelayError> {
        let env: SessionsEnvelope = self.get_json("/api/sessions").await?;
        Ok(env.sessions)
    }

    /// Session detail. The server may or may not wrap it in `{session: ...}`.
    pub async fn fetch_session(&self, session_id: &SessionId) -> Result<Session, RelayError> {
        let value: Value = self.get_json(&session_path(session_id)).await?;
        let inner = match value {
            Value::Object(mut map) if map.get("session").is_some_and(Value::is_object) => {
                map.remove("session").unwrap_or_default()
            }
            other => other,
        };
        Ok(serde_json::from_value(inner)?)
    }

    pub async fn fetch_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Message>, RelayError> {
        let env: MessagesEnvelope = self
            .get_json(&format!("{}/messages?limit={limit}", session_path(session_id)))
            .await?;
        Ok(env.messages)
    }

    pub async fn send_message(&self, session_id: &SessionId, text: &str) -> Result<(), RelayError> {
        let path = format!("{}/messages", session_path(session_id));
        self.request_ok(Method::POST, &path, Some(&json!({ "text": text })))
            .await?;
        debug!(session_id = %session_id.short(), "message sent");
        Ok(())
    }

    pub async fn set_permission_mode(
        &self,
        session_id: &SessionId,
        mode: &str,
    ) -> Result<(), RelayError> {
        let path = format!("{}/permission-mode", session_path(session_id));
        self.request_ok(Method::POST, &path, Some(&json!({ "mode": mode })))
            .await
    }

    pub async fn set_model(&self, session_id: &SessionId, model: &str) -> Result<(), RelayError> {
        let path = format!("{}/model", session_path(session_id));
        self.request_ok(Method::POST, &path, Some(&json!({ "model": model })))
            .await
    }

    pub async fn approve_request(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        let path = format!("{}/permissions/{request_id}/approve", session_path(session_id));
        self.request_ok(Method::POST, &path, Some(&json!({}))).await
    }

    pub async fn deny_request(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        let path = format!("{}/permissions/{request_id}/deny", session_path(session_id));
        self.request_ok(Method::POST, &path, Some(&json!({}))).await
    }

    pub async fn abort_session(&self, session_id: &SessionId) -> Result<(), RelayError> {
        let path = format!("{}/abort", session_path(session_id));
        self.request_ok(Method::POST, &path, Some(&json!({}))).await
    }

    /// Mark a session inactive. The PATCH requires a name, so the current
    /// title (or the short id) is sent back unchanged.
    pub async fn archive_session(&self, session_id: &SessionId) -> Result<(), RelayError> {
        let detail = self.fetch_session(session_id).await?;
        let name = detail
            .metadata
            .title()
            .map(str::to_string)
            .unwrap_or_else(|| session_id.short().to_string());
        self.request_ok(
            Method::PATCH,
            &session_path(session_id),
            Some(&json!({ "name": name, "active": false })),
        )
        .await?;
        info!(session_id = %session_id.short(), "session archived");
        Ok(())
    }

    pub async fn rename_session(&self, session_id: &SessionId, name: &str) -> Result<(), RelayError> {
        self.request_ok(Method::PATCH, &session_path(session_id), Some(&json!({ "name": name })))
            .await
    }

    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), RelayError> {
        self.request_ok(Method::DELETE, &session_path(session_id), None)
            .await?;
        info!(session_id = %session_id.short(), "session deleted");
        Ok(())
    }

    /// Online machines only.
    pub async fn fetch_machines(&self) -> Result<Vec<Machine>, RelayError> {
        let env: MachinesEnvelope = self.get_json("/api/machines").await?;
        Ok(env.machines.into_iter().filter(|m| m.active).collect())
    }

    /// Distinct working directories of known sessions, in listing order.
    pub async fn fetch_recent_paths(&self) -> Result<Vec<String>, RelayError> {
        let sessions = self.fetch_sessions().await?;
        let mut paths: Vec<String> = Vec::new();
        for path in sessions.iter().filter_map(|s| s.metadata.path()) {
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
        Ok(paths)
    }

    pub async fn spawn_session(
        &self,
        machine_id: &MachineId,
        request: &SpawnRequest,
    ) -> Result<SpawnOutcome, RelayError> {
        let path = format!("/api/machines/{machine_id}/spawn");
        let body = serde_json::to_value(request)?;
        let resp = check_status(self.request(Method::POST, &path, Some(&body)).await?).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RelayError::NetworkError(e.to_string()))?;
        let parsed: SpawnResponse = serde_json::from_slice(&bytes)?;

        Ok(match (parsed.kind.as_str(), parsed.session_id) {
            ("success", Some(session_id)) => {
                info!(session_id = %session_id.short(), machine_id = %machine_id.short(), "session spawned");
                SpawnOutcome::Success { session_id }
            }
            _ => SpawnOutcome::Failed {
                message: parsed.message.unwrap_or_else(|| "unknown error".to_string()),
            },
        })
    }
}

#[async_trait]
impl HapiApi for HapiClient {
    async fn fetch_sessions(&self) -> Result<Vec<Session>, RelayError> {
        HapiClient::fetch_sessions(self).await
    }

    async fn fetch_session(&self, session_id: &SessionId) -> Result<Session, RelayError> {
        HapiClient::fetch_session(self, session_id).await
    }

    async fn fetch_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<Message>, RelayError> {
        HapiClient::fetch_messages(self, session_id, limit).await
    }

    async fn subscribe_events(&self) -> Result<EventByteStream, RelayError> {
        HapiClient::subscribe_events(self).await
    }

    async fn approve_request(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        HapiClient::approve_request(self, session_id, request_id).await
    }

    async fn deny_request(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
    ) -> Result<(), RelayError> {
        HapiClient::deny_request(self, session_id, request_id).await
    }
}
