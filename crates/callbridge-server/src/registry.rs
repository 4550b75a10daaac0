//! Live call sessions, keyed by call id.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("call {0} already has a live session")]
    Duplicate(String),
}

/// What the registry knows about a session. The session state itself lives
/// in the call's turn controller task.
#[derive(Debug)]
struct SessionEntry {
    session_id: Uuid,
    created_at: DateTime<Utc>,
    controller: AbortHandle,
}

/// Snapshot of one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub call_id: String,
    pub created_at: DateTime<Utc>,
}

/// Tracks which calls have a live session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the controller task for `call_id`.
    ///
    /// Returns the new session id. A call id that already has a live session
    /// is rejected; the existing session is left untouched.
    pub async fn register(
        &self,
        call_id: &str,
        controller: AbortHandle,
    ) -> Result<Uuid, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(call_id) {
            return Err(RegistryError::Duplicate(call_id.to_string()));
        }
        let session_id = Uuid::new_v4();
        sessions.insert(
            call_id.to_string(),
            SessionEntry {
                session_id,
                created_at: Utc::now(),
                controller,
            },
        );
        tracing::debug!(call_id, %session_id, "session registered");
        Ok(session_id)
    }

    /// Removes the session for `call_id` if the session id matches.
    ///
    /// Returns false for stale or repeated removals.
    pub async fn remove(&self, call_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(call_id) {
            Some(entry) if entry.session_id == session_id => {
                sessions.remove(call_id);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, call_id: &str) -> bool {
        self.sessions.read().await.contains_key(call_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions
            .iter()
            .map(|(call_id, entry)| SessionSummary {
                session_id: entry.session_id,
                call_id: call_id.clone(),
                created_at: entry.created_at,
            })
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Cancels every controller and empties the registry. Used at shutdown.
    pub async fn abort_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        for (call_id, entry) in sessions.drain() {
            entry.controller.abort();
            tracing::info!(call_id = %call_id, "session cancelled at shutdown");
        }
        count
    }
}
