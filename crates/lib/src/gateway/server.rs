//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::gateway::command::{CommandResult, ErrorInfo};
use crate::gateway::dispatch::Dispatcher;
use crate::gateway::normalize::{
    self, format_channel, format_result, parse_channel_frame, ChannelFrame, FrameError, RawReply,
    ReplyTarget,
};
use crate::gateway::policy::{bearer_token, AdmissionRequest, PolicyLayer};
use crate::gateway::protocol::{ServerFrame, PROTOCOL_VERSION};
use crate::gateway::registry::{ChannelSink, ConnectionRegistry, Outbound};
use crate::handlers::{self, Capabilities};
use crate::memory::MemoryStore;
use crate::portal::{OllamaPortal, Portal};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        rejection::BytesRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, DefaultBodyLimit, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Largest `POST /command` body or text frame that is parsed. Anything larger gets a
/// `BAD_INPUT` envelope.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Shared state for both transports.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub policy: Arc<PolicyLayer>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub memory: Arc<MemoryStore>,
}

/// Wire the policy layer, registry and dispatcher together and register the built-in capabilities.
pub fn build_state(config: Config, portal: Arc<dyn Portal>) -> Result<GatewayState> {
    let policy = Arc::new(PolicyLayer::from_config(&config));
    let dispatcher = Arc::new(Dispatcher::new(config.gateway.handler_default_timeout()));
    let memory = Arc::new(MemoryStore::new());
    handlers::register_builtin(
        &dispatcher,
        Capabilities {
            memory: memory.clone(),
            portal,
            system_prompt: config.agents.system_prompt.clone(),
        },
    )
    .context("registering built-in capabilities")?;
    Ok(GatewayState {
        config: Arc::new(config),
        policy,
        registry: Arc::new(ConnectionRegistry::new()),
        dispatcher,
        memory,
    })
}

/// Routes for both transports plus the CORS layer for browser clients.
pub fn router(state: GatewayState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/", get(health_http))
        .route("/health", get(health_http))
        .route("/command", post(command_http))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(MAX_FRAME_BYTES))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = &config.gateway.allowed_origins;
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.trim().trim_end_matches('/').parse::<HeaderValue>().ok())
            .collect();
        AllowOrigin::list(values)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600))
}

/// Start the gateway from config and run until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && config::required_token(&config).is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or PORTICO_GATEWAY_TOKEN)",
            bind
        );
    }

    let portal: Arc<dyn Portal> = Arc::new(OllamaPortal::from_config(&config.agents));
    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let state = build_state(config, portal)?;
    if !state.policy.auth_enabled() {
        log::warn!("gateway auth is disabled; every loopback client is trusted");
    }

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    serve(listener, state, shutdown_signal()).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Serve on an already-bound listener until `shutdown` resolves, then notify and close every
/// streaming connection. The idle sweeper runs for the lifetime of the server.
pub async fn serve<F>(listener: TcpListener, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = spawn_sweeper(state.clone());
    let registry = state.registry.clone();
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            announce_shutdown(&registry);
        })
        .await
        .context("gateway server exited");
    sweeper.abort();
    result
}

/// Broadcast the shutdown frame, then close every registered connection.
fn announce_shutdown(registry: &ConnectionRegistry) {
    let notified = registry.broadcast(&ServerFrame::Shutdown.to_text(), |_| true);
    let closed = registry.close_all();
    log::info!(
        "shutdown: notified {} connection(s), closed {}",
        notified,
        closed
    );
}

/// Future that completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and closing connections");
}

/// Periodic maintenance: evict idle connections, prune stale rate windows and memory sessions,
/// broadcast a tick.
fn spawn_sweeper(state: GatewayState) -> JoinHandle<()> {
    let period = state.config.gateway.sweep_interval();
    let idle = state.config.gateway.idle_timeout();
    let session_idle = state.config.gateway.session_idle_timeout();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let now = Instant::now();
            let evicted = state.registry.sweep_idle(now, idle);
            if !evicted.is_empty() {
                log::info!("sweeper: evicted {} idle connection(s)", evicted.len());
            }
            let pruned = state.policy.limiter().prune(now);
            if pruned > 0 {
                log::debug!("sweeper: pruned {} rate window(s)", pruned);
            }
            if let Some(session_idle) = session_idle {
                let dropped = state.memory.prune_idle(now, session_idle).await;
                if dropped > 0 {
                    log::debug!("sweeper: dropped {} idle memory session(s)", dropped);
                }
            }
            let tick = ServerFrame::Tick {
                ts: chrono::Utc::now().timestamp_millis(),
            };
            state.registry.broadcast(&tick.to_text(), |_| true);
        }
    })
}

/// GET / and GET /health: liveness probe. Not authenticated, not rate limited.
async fn health_http(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "runtime": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "connections": state.registry.len(),
        "capabilities": state.dispatcher.names(),
    }))
}

/// POST /command: one command per request, answered with the result envelope.
async fn command_http(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let client_key = addr.ip().to_string();
    let admission = AdmissionRequest {
        client_key: &client_key,
        token: header_token(&headers),
        origin: header_str(&headers, header::ORIGIN),
    };
    if let Err(denied) = state.policy.admit(&admission, Instant::now()) {
        log::debug!("command from {} denied: {}", client_key, denied);
        return http_reply(CommandResult::from(denied));
    }

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            log::debug!("command from {}: unreadable body: {}", client_key, rejection);
            return http_reply(CommandResult::from(ErrorInfo::bad_input(format!(
                "unreadable request body: {}",
                rejection.body_text()
            ))));
        }
    };

    let origin_id = format!("req-{}", uuid::Uuid::new_v4());
    let command = match normalize::parse_request(&body, &origin_id) {
        Ok(c) => c,
        Err(e) => return http_reply(CommandResult::from(e)),
    };
    log::debug!("command {} from {} ({})", command.name(), client_key, origin_id);
    http_reply(state.dispatcher.dispatch(command).await)
}

fn http_reply(result: CommandResult) -> Response {
    match format_result(result, ReplyTarget::Request) {
        RawReply::Http { status, body } => (status, Json(body)).into_response(),
        RawReply::Channel(text) => (StatusCode::OK, text).into_response(),
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::AUTHORIZATION).and_then(bearer_token)
}

/// GET /ws: admission runs before the upgrade so a denied client never gets a socket.
async fn ws_handler(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let client_key = addr.ip().to_string();
    let token = header_token(&headers)
        .map(str::to_string)
        .or_else(|| query.get("token").map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty());
    let origin = header_str(&headers, header::ORIGIN).map(str::to_string);

    let admission = AdmissionRequest {
        client_key: &client_key,
        token: token.as_deref(),
        origin: origin.as_deref(),
    };
    if let Err(denied) = state.policy.admit(&admission, Instant::now()) {
        log::debug!("ws handshake from {} denied: {}", client_key, denied);
        return http_reply(CommandResult::from(denied));
    }

    let peer = Peer {
        client_key,
        token,
        origin,
    };
    ws.max_message_size(MAX_FRAME_BYTES * 2)
        .on_upgrade(move |socket| handle_socket(socket, state, peer))
}

/// What the handshake established about the remote end; re-checked for every command frame.
struct Peer {
    client_key: String,
    token: Option<String>,
    origin: Option<String>,
}

impl Peer {
    fn admission(&self) -> AdmissionRequest<'_> {
        AdmissionRequest {
            client_key: &self.client_key,
            token: self.token.as_deref(),
            origin: self.origin.as_deref(),
        }
    }
}

/// Unregisters the connection however the socket task ends.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

async fn handle_socket(socket: WebSocket, state: GatewayState, peer: Peer) {
    let (mut sink, mut stream) = socket.split();
    let (channel, mut outbound) = ChannelSink::new();
    let id = state.registry.register(channel);
    let _registration = Registration {
        registry: state.registry.clone(),
        id: id.clone(),
    };
    log::info!("ws connected: {} from {}", id, peer.client_key);

    // Single writer: every frame for this connection goes through the registry's sink.
    let mut writer = tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let hello = ServerFrame::Hello {
        connection_id: id.clone(),
        protocol: PROTOCOL_VERSION,
        tick_interval_ms: state.config.gateway.sweep_interval().as_millis() as u64,
    };
    state.registry.send(&id, hello.to_text());

    loop {
        tokio::select! {
            _ = &mut writer => break,
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                state.registry.touch(&id, Instant::now());
                match msg {
                    Message::Text(text) => handle_text(&state, &peer, &id, &text),
                    Message::Binary(_) => {
                        let err = FrameError {
                            id: None,
                            error: ErrorInfo::bad_input("binary frames are not supported"),
                        };
                        state.registry.send(&id, err.into_frame().to_text());
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    writer.abort();
    log::info!("ws disconnected: {}", id);
}

/// One text frame: size check, admission, normalization, then reply or dispatch.
fn handle_text(state: &GatewayState, peer: &Peer, id: &str, text: &str) {
    if text.len() > MAX_FRAME_BYTES {
        let err = FrameError {
            id: None,
            error: ErrorInfo::bad_input(format!("frame exceeds {} bytes", MAX_FRAME_BYTES)),
        };
        state.registry.send(id, err.into_frame().to_text());
        return;
    }

    let frame = match parse_channel_frame(text, id) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("ws {}: rejected frame: {}", id, e);
            state.registry.send(id, e.into_frame().to_text());
            return;
        }
    };

    match frame {
        ChannelFrame::Ping { id: frame_id } => {
            state
                .registry
                .send(id, ServerFrame::Pong { id: frame_id }.to_text());
        }
        ChannelFrame::Command {
            id: frame_id,
            reply,
            command,
        } => {
            if let Err(denied) = state.policy.admit(&peer.admission(), Instant::now()) {
                state
                    .registry
                    .send(id, format_channel(reply, frame_id, CommandResult::from(denied)));
                return;
            }
            // Frames on one connection run concurrently; the echoed id correlates replies.
            let registry = state.registry.clone();
            let dispatcher = state.dispatcher.clone();
            let origin_id = command.origin_id().to_string();
            tokio::spawn(async move {
                let result = dispatcher.dispatch(command).await;
                if !registry.send(&origin_id, format_channel(reply, frame_id, result)) {
                    log::debug!("ws {}: reply dropped, connection gone", origin_id);
                }
            });
        }
    }
}
