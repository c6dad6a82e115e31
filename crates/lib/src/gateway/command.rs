//! Canonical command and result values shared by both transports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Which transport a command arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OriginKind {
    /// Synchronous request/response (HTTP).
    Request,
    /// Persistent streaming channel (WebSocket).
    Channel,
}

/// One inbound request normalized away from its transport. Fields are read-only after construction.
#[derive(Debug, Clone)]
pub struct Command {
    name: String,
    parameters: Map<String, Value>,
    origin_kind: OriginKind,
    origin_id: String,
    issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        parameters: Map<String, Value>,
        origin_kind: OriginKind,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters,
            origin_kind,
            origin_id: origin_id.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn origin_kind(&self) -> OriginKind {
        self.origin_kind
    }

    /// Request id for HTTP, connection id for channels.
    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// String parameter by key, if present and a string.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Error taxonomy reported to callers on either transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    RateLimited,
    BadInput,
    HandlerFailure,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::BadInput => "BAD_INPUT",
            ErrorKind::HandlerFailure => "HANDLER_FAILURE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadInput, message)
    }

    pub fn handler_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerFailure, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Outcome of one command. Wire shape: `{ success, payload?, error?, elapsedMillis }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub elapsed_millis: u64,
}

impl CommandResult {
    pub fn ok(payload: Value, elapsed_millis: u64) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            elapsed_millis,
        }
    }

    pub fn err(error: ErrorInfo, elapsed_millis: u64) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error),
            elapsed_millis,
        }
    }

    /// Error kind when the command failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

impl From<ErrorInfo> for CommandResult {
    /// Rejections before dispatch (policy, parsing) take no measurable time.
    fn from(error: ErrorInfo) -> Self {
        Self::err(error, 0)
    }
}
