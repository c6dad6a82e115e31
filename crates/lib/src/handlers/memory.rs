//! `memory.history` and `memory.clear`.

use super::required_str;
use crate::gateway::{Command, Handler, HandlerError, HandlerOutcome};
use crate::memory::MemoryStore;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct MemoryHistoryHandler {
    memory: Arc<MemoryStore>,
}

impl MemoryHistoryHandler {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Handler for MemoryHistoryHandler {
    async fn execute(&self, command: &Command) -> HandlerOutcome {
        let session_id = required_str(command, "sessionId")?;
        let messages = self
            .memory
            .history(session_id)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        Ok(json!({ "sessionId": session_id, "messages": messages }))
    }
}

pub struct MemoryClearHandler {
    memory: Arc<MemoryStore>,
}

impl MemoryClearHandler {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Handler for MemoryClearHandler {
    async fn execute(&self, command: &Command) -> HandlerOutcome {
        let session_id = required_str(command, "sessionId")?;
        let cleared = self.memory.remove(session_id).await;
        Ok(json!({ "cleared": cleared }))
    }
}
