//! Command normalizer: transport messages in, canonical [`Command`] out, and back again.
//!
//! Inbound envelope (either transport): `{ "name": string, "parameters": object }`.
//! Streaming frames add a `type` (`ping`, `command`, `chat`) and an optional correlation `id`.
//! Nothing malformed gets past this module to the dispatcher.

use crate::gateway::command::{Command, CommandResult, ErrorInfo, ErrorKind, OriginKind};
use crate::gateway::protocol::{ReplyKind, ServerFrame};
use axum::http::StatusCode;
use serde_json::{Map, Value};

/// Parsed streaming frame.
#[derive(Debug, Clone)]
pub enum ChannelFrame {
    Ping {
        id: Option<String>,
    },
    Command {
        id: Option<String>,
        reply: ReplyKind,
        command: Command,
    },
}

/// A frame that could not be normalized; `id` is echoed when it could be read.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct FrameError {
    pub id: Option<String>,
    pub error: ErrorInfo,
}

impl FrameError {
    fn new(id: Option<String>, error: ErrorInfo) -> Self {
        Self { id, error }
    }

    pub fn into_frame(self) -> ServerFrame {
        ServerFrame::Error {
            id: self.id,
            error: self.error,
        }
    }
}

/// Where a formatted reply is going.
#[derive(Debug, Clone)]
pub enum ReplyTarget {
    Request,
    Channel { reply: ReplyKind, id: Option<String> },
}

impl ReplyTarget {
    pub fn origin_kind(&self) -> OriginKind {
        match self {
            ReplyTarget::Request => OriginKind::Request,
            ReplyTarget::Channel { .. } => OriginKind::Channel,
        }
    }
}

/// Transport-ready reply.
#[derive(Debug, Clone, PartialEq)]
pub enum RawReply {
    Http { status: StatusCode, body: Value },
    Channel(String),
}

/// Parse an HTTP request body into a command.
pub fn parse_request(body: &[u8], origin_id: &str) -> Result<Command, ErrorInfo> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ErrorInfo::bad_input(format!("invalid JSON body: {}", e)))?;
    let Value::Object(obj) = value else {
        return Err(ErrorInfo::bad_input("command envelope must be a JSON object"));
    };
    let name = command_name(&obj)?;
    let parameters = parameters(&obj)?;
    Ok(Command::new(name, parameters, OriginKind::Request, origin_id))
}

/// Parse one text frame from a streaming connection.
pub fn parse_channel_frame(raw: &str, origin_id: &str) -> Result<ChannelFrame, FrameError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| FrameError::new(None, ErrorInfo::bad_input(format!("invalid JSON frame: {}", e))))?;
    let Value::Object(mut obj) = value else {
        return Err(FrameError::new(
            None,
            ErrorInfo::bad_input("frame must be a JSON object"),
        ));
    };
    let id = frame_id(&obj);
    let typ = match obj.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => {
            return Err(FrameError::new(id, ErrorInfo::bad_input("frame type must be a string")))
        }
        None => return Err(FrameError::new(id, ErrorInfo::bad_input("missing frame type"))),
    };
    match typ.as_str() {
        "ping" => Ok(ChannelFrame::Ping { id }),
        "command" => {
            let name = command_name(&obj).map_err(|e| FrameError::new(id.clone(), e))?;
            let parameters = parameters(&obj).map_err(|e| FrameError::new(id.clone(), e))?;
            Ok(ChannelFrame::Command {
                id,
                reply: ReplyKind::CommandResponse,
                command: Command::new(name, parameters, OriginKind::Channel, origin_id),
            })
        }
        // Chat shorthand: every field but type/id becomes a parameter of the `chat` capability.
        "chat" => {
            obj.remove("type");
            obj.remove("id");
            Ok(ChannelFrame::Command {
                id,
                reply: ReplyKind::ChatResponse,
                command: Command::new("chat", obj, OriginKind::Channel, origin_id),
            })
        }
        other => Err(FrameError::new(
            id,
            ErrorInfo::bad_input(format!("unknown frame type: {}", other)),
        )),
    }
}

/// Status for a result: 200 on success, otherwise derived from the error kind.
pub fn http_status(result: &CommandResult) -> StatusCode {
    match result.error_kind() {
        None if result.success => StatusCode::OK,
        Some(ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::Unauthorized) => StatusCode::UNAUTHORIZED,
        Some(ErrorKind::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        Some(ErrorKind::BadInput) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Response body mirrors the result fields directly.
pub fn format_http(result: &CommandResult) -> (StatusCode, Value) {
    let body = serde_json::to_value(result).unwrap_or(Value::Null);
    (http_status(result), body)
}

/// Wrap a result in the response envelope for a streaming peer.
pub fn format_channel(reply: ReplyKind, id: Option<String>, result: CommandResult) -> String {
    reply.frame(id, result).to_text()
}

/// Format a result for whichever transport it came from.
pub fn format_result(result: CommandResult, target: ReplyTarget) -> RawReply {
    match target {
        ReplyTarget::Request => {
            let (status, body) = format_http(&result);
            RawReply::Http { status, body }
        }
        ReplyTarget::Channel { reply, id } => RawReply::Channel(format_channel(reply, id, result)),
    }
}

fn command_name(obj: &Map<String, Value>) -> Result<String, ErrorInfo> {
    match obj.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => Ok(name.trim().to_string()),
        Some(Value::String(_)) => Err(ErrorInfo::bad_input("command name must not be empty")),
        Some(_) => Err(ErrorInfo::bad_input("command name must be a string")),
        None => Err(ErrorInfo::bad_input("missing command name")),
    }
}

fn parameters(obj: &Map<String, Value>) -> Result<Map<String, Value>, ErrorInfo> {
    match obj.get("parameters") {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(ErrorInfo::bad_input("parameters must be a JSON object")),
    }
}

/// Correlation id: strings pass through, numbers are stringified, anything else is ignored.
fn frame_id(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_request_builds_command() {
        let cmd = parse_request(br#"{"name":"echo","parameters":{"text":"hi"}}"#, "req-1").unwrap();
        assert_eq!(cmd.name(), "echo");
        assert_eq!(cmd.str_param("text"), Some("hi"));
        assert_eq!(cmd.origin_kind(), OriginKind::Request);
        assert_eq!(cmd.origin_id(), "req-1");
    }

    #[test]
    fn parse_request_defaults_missing_parameters() {
        let cmd = parse_request(br#"{"name":"capabilities"}"#, "r").unwrap();
        assert!(cmd.parameters().is_empty());
        let cmd = parse_request(br#"{"name":"capabilities","parameters":null}"#, "r").unwrap();
        assert!(cmd.parameters().is_empty());
    }

    #[test]
    fn parse_request_rejects_malformed_input() {
        let bodies: [&[u8]; 6] = [
            b"not json",
            br#"[1,2]"#,
            br#"{"parameters":{}}"#,
            br#"{"name":42}"#,
            br#"{"name":"  "}"#,
            br#"{"name":"echo","parameters":"text"}"#,
        ];
        for body in bodies {
            let err = parse_request(body, "r").unwrap_err();
            assert_eq!(err.kind, ErrorKind::BadInput, "body {:?}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn parse_ping_and_command_frames() {
        match parse_channel_frame(r#"{"type":"ping","id":5}"#, "conn-1").unwrap() {
            ChannelFrame::Ping { id } => assert_eq!(id.as_deref(), Some("5")),
            other => panic!("unexpected {:?}", other),
        }
        match parse_channel_frame(
            r#"{"type":"command","id":"a","name":"echo","parameters":{"text":"x"}}"#,
            "conn-1",
        )
        .unwrap()
        {
            ChannelFrame::Command { id, reply, command } => {
                assert_eq!(id.as_deref(), Some("a"));
                assert_eq!(reply, ReplyKind::CommandResponse);
                assert_eq!(command.name(), "echo");
                assert_eq!(command.origin_kind(), OriginKind::Channel);
                assert_eq!(command.origin_id(), "conn-1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn chat_frame_normalizes_to_chat_command() {
        match parse_channel_frame(
            r#"{"type":"chat","id":"c1","message":"hello","sessionId":"s"}"#,
            "conn-2",
        )
        .unwrap()
        {
            ChannelFrame::Command { id, reply, command } => {
                assert_eq!(id.as_deref(), Some("c1"));
                assert_eq!(reply, ReplyKind::ChatResponse);
                assert_eq!(command.name(), "chat");
                assert_eq!(command.str_param("message"), Some("hello"));
                assert_eq!(command.str_param("sessionId"), Some("s"));
                assert!(command.parameters().get("type").is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_frames_keep_their_id_when_readable() {
        let err = parse_channel_frame(r#"{"type":"dance","id":"d"}"#, "c").unwrap_err();
        assert_eq!(err.id.as_deref(), Some("d"));
        assert_eq!(err.error.kind, ErrorKind::BadInput);

        let err = parse_channel_frame(r#"{"type":"command","id":"e"}"#, "c").unwrap_err();
        assert_eq!(err.id.as_deref(), Some("e"));

        let err = parse_channel_frame("{oops", "c").unwrap_err();
        assert_eq!(err.id, None);

        let frame = parse_channel_frame(r#"{"id":"m"}"#, "c").unwrap_err().into_frame();
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "error", "id": "m", "error": { "kind": "BAD_INPUT", "message": "missing frame type" } })
        );
    }

    #[test]
    fn status_mapping_follows_error_kind() {
        let cases = [
            (ErrorKind::NotFound, StatusCode::NOT_FOUND),
            (ErrorKind::Unauthorized, StatusCode::UNAUTHORIZED),
            (ErrorKind::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (ErrorKind::BadInput, StatusCode::BAD_REQUEST),
            (ErrorKind::HandlerFailure, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorKind::Timeout, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (kind, status) in cases {
            let result = CommandResult::from(ErrorInfo::new(kind, "x"));
            assert_eq!(http_status(&result), status);
        }
        assert_eq!(http_status(&CommandResult::ok(json!(1), 0)), StatusCode::OK);
    }

    #[test]
    fn format_result_per_transport() {
        let result = CommandResult::ok(json!("hi"), 2);
        match format_result(result.clone(), ReplyTarget::Request) {
            RawReply::Http { status, body } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(body, json!({ "success": true, "payload": "hi", "elapsedMillis": 2 }));
            }
            other => panic!("unexpected {:?}", other),
        }
        let target = ReplyTarget::Channel {
            reply: ReplyKind::CommandResponse,
            id: Some("9".to_string()),
        };
        assert_eq!(target.origin_kind(), OriginKind::Channel);
        match format_result(result, target) {
            RawReply::Channel(text) => {
                let v: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(v["type"], "command_response");
                assert_eq!(v["id"], "9");
                assert_eq!(v["result"]["payload"], "hi");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
