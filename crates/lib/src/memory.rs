//! Conversation memory for the agent: sessions keyed by id, each an ordered message history.
//!
//! Only capability handlers touch this store; the dispatcher never sees it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// A single remembered message (role + content).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
}

impl SessionMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
}

struct Session {
    messages: Vec<SessionMessage>,
    last_active: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            last_active: Instant::now(),
        }
    }
}

/// In-memory store for sessions (create, get, append, remove, prune).
pub struct MemoryStore {
    inner: RwLock<HashMap<SessionId, Session>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new session with a generated id; returns the session id.
    pub async fn create(&self) -> SessionId {
        let id = format!("sess-{}", uuid::Uuid::new_v4());
        self.inner.write().await.insert(id.clone(), Session::new());
        id
    }

    /// Create a session with the given id if it does not exist; returns the id.
    pub async fn get_or_create(&self, id: impl Into<SessionId>) -> SessionId {
        let id = id.into();
        self.inner
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(Session::new)
            .last_active = Instant::now();
        id
    }

    /// Append a message; errors if the session does not exist.
    pub async fn append(&self, id: &str, message: SessionMessage) -> Result<(), MemoryError> {
        let mut g = self.inner.write().await;
        let session = g
            .get_mut(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.to_string()))?;
        session.messages.push(message);
        session.last_active = Instant::now();
        Ok(())
    }

    /// Copy of the session's messages in order.
    pub async fn history(&self, id: &str) -> Result<Vec<SessionMessage>, MemoryError> {
        self.inner
            .read()
            .await
            .get(id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| MemoryError::SessionNotFound(id.to_string()))
    }

    /// Forget a session. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Drop sessions with no activity for longer than `idle`. Returns how many were dropped.
    pub async fn prune_idle(&self, now: Instant, idle: Duration) -> usize {
        let mut g = self.inner.write().await;
        let before = g.len();
        g.retain(|_, s| now.saturating_duration_since(s.last_active) <= idle);
        before - g.len()
    }
}
