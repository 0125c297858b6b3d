use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use relay_core::ids::SessionId;
use relay_core::session::{Session, SessionPatch};

use crate::format::session_label_short;

/// Shared, cloneable handle to the last known session list.
///
/// Listings replace it wholesale; stream events patch single entries.
/// Patches for sessions not in the list are dropped until the next listing.
#[derive(Clone, Default)]
pub struct SessionCache {
    inner: Arc<RwLock<Vec<Session>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&self, sessions: Vec<Session>) {
        *self.inner.write() = sessions;
    }

    /// Apply a partial update. Returns `false` if the session is unknown.
    pub fn apply_patch(&self, session_id: &SessionId, patch: &SessionPatch) -> bool {
        let mut sessions = self.inner.write();
        let Some(session) = sessions.iter_mut().find(|s| &s.id == session_id) else {
            return false;
        };
        if let Err(e) = session.apply(patch) {
            warn!(session_id = %session_id, error = %e, "ignoring malformed metadata patch");
        }
        true
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.inner.read().iter().find(|s| &s.id == session_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Session> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn label_short(&self, session_id: &SessionId) -> String {
        session_label_short(session_id, &self.inner.read())
    }
}
