//! Built-in capabilities registered at startup: echo, chat, memory, and capability listing.
//!
//! Each handler validates its own parameters; the dispatcher treats them as opaque.

mod chat;
mod memory;

use crate::gateway::{
    Command, Dispatcher, Handler, HandlerError, HandlerOutcome, RegisterMode, RegistrationError,
    TimeoutPolicy,
};
use crate::memory::MemoryStore;
use crate::portal::Portal;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Weak};

pub use chat::ChatHandler;
pub use memory::{MemoryClearHandler, MemoryHistoryHandler};

/// Collaborators the built-in handlers need.
#[derive(Clone)]
pub struct Capabilities {
    pub memory: Arc<MemoryStore>,
    pub portal: Arc<dyn Portal>,
    pub system_prompt: Option<String>,
}

/// Register every built-in handler. Fails if any name is already taken.
pub fn register_builtin(
    dispatcher: &Arc<Dispatcher>,
    caps: Capabilities,
) -> Result<(), RegistrationError> {
    dispatcher.register_with("echo", Arc::new(EchoHandler), TimeoutPolicy::Unbounded, RegisterMode::Reject)?;
    dispatcher.register_with(
        "capabilities",
        Arc::new(CapabilitiesHandler {
            dispatcher: Arc::downgrade(dispatcher),
        }),
        TimeoutPolicy::Unbounded,
        RegisterMode::Reject,
    )?;
    dispatcher.register(
        "chat",
        ChatHandler::new(caps.memory.clone(), caps.portal, caps.system_prompt),
        RegisterMode::Reject,
    )?;
    dispatcher.register_with(
        "memory.history",
        Arc::new(MemoryHistoryHandler::new(caps.memory.clone())),
        TimeoutPolicy::Unbounded,
        RegisterMode::Reject,
    )?;
    dispatcher.register_with(
        "memory.clear",
        Arc::new(MemoryClearHandler::new(caps.memory)),
        TimeoutPolicy::Unbounded,
        RegisterMode::Reject,
    )?;
    log::info!("registered {} built-in capabilities", dispatcher.names().len());
    Ok(())
}

/// Returns `parameters.text` unchanged.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn execute(&self, command: &Command) -> HandlerOutcome {
        command
            .str_param("text")
            .map(|t| json!(t))
            .ok_or_else(|| HandlerError::InvalidParams("text must be a string".to_string()))
    }
}

/// Lists registered capability names. Holds a weak reference so the dispatcher can own it.
struct CapabilitiesHandler {
    dispatcher: Weak<Dispatcher>,
}

#[async_trait]
impl Handler for CapabilitiesHandler {
    async fn execute(&self, _command: &Command) -> HandlerOutcome {
        let dispatcher = self
            .dispatcher
            .upgrade()
            .ok_or_else(|| HandlerError::Failed("dispatcher is shutting down".to_string()))?;
        Ok(json!({ "capabilities": dispatcher.names() }))
    }
}

/// Required string parameter.
fn required_str<'a>(command: &'a Command, key: &str) -> Result<&'a str, HandlerError> {
    match command.str_param(key) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(HandlerError::InvalidParams(format!("{} must be a non-empty string", key))),
    }
}
