//! `chat`: one conversational turn against the portal, remembered in the session.

use super::required_str;
use crate::gateway::{Command, Handler, HandlerError, HandlerOutcome};
use crate::memory::{MemoryStore, SessionMessage};
use crate::portal::{ChatMessage, Portal};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Parameters: `{ message, sessionId? }`. Returns `{ reply, sessionId }`.
pub struct ChatHandler {
    memory: Arc<MemoryStore>,
    portal: Arc<dyn Portal>,
    system_prompt: Option<String>,
}

impl ChatHandler {
    pub fn new(memory: Arc<MemoryStore>, portal: Arc<dyn Portal>, system_prompt: Option<String>) -> Self {
        Self {
            memory,
            portal,
            system_prompt: system_prompt.filter(|p| !p.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Handler for ChatHandler {
    async fn execute(&self, command: &Command) -> HandlerOutcome {
        let message = required_str(command, "message")?;
        let session_id = match command.parameters().get("sessionId") {
            None | Some(serde_json::Value::Null) => self.memory.create().await,
            Some(serde_json::Value::String(id)) if !id.trim().is_empty() => {
                self.memory.get_or_create(id.trim()).await
            }
            Some(_) => {
                return Err(HandlerError::InvalidParams(
                    "sessionId must be a non-empty string".to_string(),
                ))
            }
        };

        self.memory
            .append(&session_id, SessionMessage::user(message))
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        let history = self
            .memory
            .history(&session_id)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        let mut messages: Vec<ChatMessage> = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::from(&SessionMessage::system(prompt.trim())));
        }
        messages.extend(history.iter().map(ChatMessage::from));

        let reply = self.portal.complete(messages).await.map_err(|e| {
            log::warn!("chat: portal failed for {}: {}", session_id, e);
            HandlerError::Failed(e.to_string())
        })?;
        self.memory
            .append(&session_id, SessionMessage::assistant(reply.clone()))
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        Ok(json!({ "reply": reply, "sessionId": session_id }))
    }
}
