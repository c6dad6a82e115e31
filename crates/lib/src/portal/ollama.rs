//! Ollama API client (http://127.0.0.1:11434 by default), non-streaming chat only.

use super::{Portal, PortalError};
use crate::config::AgentsConfig;
use crate::memory::SessionMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "llama3.2:latest";

/// Portal backed by an Ollama server.
#[derive(Clone)]
pub struct OllamaPortal {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaPortal {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(agents: &AgentsConfig) -> Self {
        Self::new(agents.base_url.clone(), agents.default_model.clone())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// POST /api/chat, non-streaming.
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<ChatResponse, PortalError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(PortalError::Api(format!("{} {}", status, body)));
        }
        let data: ChatResponse = res.json().await?;
        Ok(data)
    }
}

#[async_trait]
impl Portal for OllamaPortal {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, PortalError> {
        log::debug!("ollama: chat with {} message(s) on {}", messages.len(), self.model);
        let res = self.chat(messages).await?;
        Ok(res.content().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl From<&SessionMessage> for ChatMessage {
    fn from(m: &SessionMessage) -> Self {
        Self {
            role: m.role.clone(),
            content: m.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done: bool,
}

impl ChatResponse {
    /// Text content of the assistant message, if any.
    pub fn content(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_and_trimming() {
        let portal = OllamaPortal::new(Some("http://host:1234/".to_string()), Some("  ".to_string()));
        assert_eq!(portal.base_url, "http://host:1234");
        assert_eq!(portal.model(), DEFAULT_MODEL);
    }

    #[test]
    fn request_is_non_streaming() {
        let req = ChatRequest {
            model: "m",
            messages: vec![ChatMessage::from(&SessionMessage::user("hi"))],
            stream: false,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({ "model": "m", "messages": [{ "role": "user", "content": "hi" }], "stream": false })
        );
    }

    #[test]
    fn response_content_tolerates_missing_message() {
        let res: ChatResponse =
            serde_json::from_value(json!({ "message": { "role": "assistant", "content": "yo" }, "done": true }))
                .unwrap();
        assert_eq!(res.content(), "yo");
        let empty: ChatResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.content(), "");
    }
}
