use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use relay_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::kv::KvStore;

const KNOWN_USERS_KEY: &str = "known_users";

/// Per-user preferences persisted across restarts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserState {
    pub current_session: Option<SessionId>,
    pub current_flavor: Option<String>,
    /// Where notifications for this user go.
    pub notify_target: Option<String>,
}

impl UserState {
    /// The notify target when it is an http(s) URL.
    pub fn webhook_url(&self) -> Option<&str> {
        self.notify_target
            .as_deref()
            .filter(|t| t.starts_with("http://") || t.starts_with("https://"))
    }
}

/// Stores [`UserState`] under `user_state_<id>` and keeps a `known_users` index.
#[derive(Clone)]
pub struct UserStateRepo {
    kv: KvStore,
}

impl UserStateRepo {
    pub fn new(db: Database) -> Self {
        Self { kv: KvStore::new(db) }
    }

    fn key(user_id: &str) -> String {
        format!("user_state_{user_id}")
    }

    pub fn known_users(&self) -> Result<Vec<String>, StoreError> {
        self.kv.get_or(KNOWN_USERS_KEY, Vec::new())
    }

    pub fn get(&self, user_id: &str) -> Result<Option<UserState>, StoreError> {
        self.kv.get(&Self::key(user_id))
    }

    /// Persist `state`, registering the user if new. Unchanged state is not rewritten.
    pub fn save(&self, user_id: &str, state: &UserState) -> Result<(), StoreError> {
        if self.get(user_id)?.as_ref() == Some(state) {
            debug!(user_id, "user state unchanged");
            return Ok(());
        }
        self.kv.put(&Self::key(user_id), state)?;

        let mut known = self.known_users()?;
        if !known.iter().any(|u| u == user_id) {
            known.push(user_id.to_string());
            self.kv.put(KNOWN_USERS_KEY, &known)?;
        }
        Ok(())
    }

    /// Read-modify-write helper.
    pub fn update<F>(&self, user_id: &str, f: F) -> Result<UserState, StoreError>
    where
        F: FnOnce(&mut UserState),
    {
        let mut state = self.get(user_id)?.unwrap_or_default();
        f(&mut state);
        self.save(user_id, &state)?;
        Ok(state)
    }

    /// Every known user with stored state. Unreadable entries are skipped.
    pub fn load_all(&self) -> Result<Vec<(String, UserState)>, StoreError> {
        let mut out = Vec::new();
        for user_id in self.known_users()? {
            match self.get(&user_id) {
                Ok(Some(state)) => out.push((user_id, state)),
                Ok(None) => {}
                Err(e) => warn!(user_id = %user_id, error = %e, "skipping unreadable user state"),
            }
        }
        Ok(out)
    }

    pub fn remove(&self, user_id: &str) -> Result<(), StoreError> {
        self.kv.delete(&Self::key(user_id))?;
        let mut known = self.known_users()?;
        let before = known.len();
        known.retain(|u| u != user_id);
        if known.len() != before {
            self.kv.put(KNOWN_USERS_KEY, &known)?;
        }
        Ok(())
    }
}
