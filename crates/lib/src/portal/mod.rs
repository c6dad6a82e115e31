//! Agent portal: the reasoning backend behind the `chat` capability.
//!
//! The gateway only knows the [`Portal`] trait; the Ollama client is the shipped implementation.

mod ollama;

use async_trait::async_trait;

pub use ollama::{ChatMessage, OllamaPortal};

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("portal request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("portal api error: {0}")]
    Api(String),
}

/// One completion over a message history; returns the assistant's reply text.
#[async_trait]
pub trait Portal: Send + Sync {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, PortalError>;
}
