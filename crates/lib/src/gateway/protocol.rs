//! Gateway wire types: server-to-client frames on the streaming channel.
//!
//! Every frame carries a `type` discriminator so peers can tell replies apart:
//! `hello`, `pong`, `command_response`, `chat_response`, `error`, `tick`, `shutdown`.

use crate::gateway::command::{CommandResult, ErrorInfo};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Frame pushed from the gateway to a connected peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame after the upgrade.
    #[serde(rename_all = "camelCase")]
    Hello {
        connection_id: String,
        protocol: u32,
        tick_interval_ms: u64,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    CommandResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        result: CommandResult,
    },
    ChatResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        result: CommandResult,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: ErrorInfo,
    },
    /// Keep-alive broadcast by the sweeper.
    Tick { ts: i64 },
    Shutdown,
}

impl ServerFrame {
    /// Serialize for the socket. Serialization of these types cannot fail in practice.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}

/// Which response discriminator a dispatched frame is answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    CommandResponse,
    ChatResponse,
}

impl ReplyKind {
    pub fn frame(self, id: Option<String>, result: CommandResult) -> ServerFrame {
        match self {
            ReplyKind::CommandResponse => ServerFrame::CommandResponse { id, result },
            ReplyKind::ChatResponse => ServerFrame::ChatResponse { id, result },
        }
    }
}
