use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Parser)]
#[command(name = "portico")]
#[command(about = "Portico agent gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway (HTTP + WebSocket on one port).
    Gateway {
        /// Config file path (default: PORTICO_CONFIG_PATH or ~/.portico/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Issue one command to a running gateway and print the result envelope.
    Send {
        /// Config file path (default: PORTICO_CONFIG_PATH or ~/.portico/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Capability name, e.g. `echo` or `capabilities`.
        name: String,

        /// Parameters as a JSON object.
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Chat with the agent through the gateway (interactive).
    Chat {
        /// Config file path (default: PORTICO_CONFIG_PATH or ~/.portico/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Optional existing session id to continue.
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("portico {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            name,
            params,
        }) => {
            if let Err(e) = run_send(config, name, params).await {
                log::error!("send failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, session }) => {
            if let Err(e) = run_chat(config, session).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = portico::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    portico::gateway::run_gateway(config).await
}

async fn run_send(
    config_path: Option<std::path::PathBuf>,
    name: String,
    params: String,
) -> anyhow::Result<()> {
    let parameters: Value = serde_json::from_str(&params).context("params must be JSON")?;
    if !parameters.is_object() {
        anyhow::bail!("params must be a JSON object");
    }
    let mut ws = connect(config_path).await?;
    let frame = json!({ "type": "command", "id": "1", "name": name, "parameters": parameters });
    let reply = request(&mut ws, frame, "1").await?;
    let _ = ws.close(None).await;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    let ok = reply
        .get("result")
        .and_then(|r| r.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !ok {
        std::process::exit(2);
    }
    Ok(())
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    session: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let mut ws = connect(config_path).await?;
    let mut current_session = session;
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut turn: u64 = 0;

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }

        turn += 1;
        let id = turn.to_string();
        let mut frame = json!({ "type": "chat", "id": id, "message": input });
        if let Some(ref s) = current_session {
            frame["sessionId"] = Value::String(s.clone());
        }
        let reply = request(&mut ws, frame, &id).await?;
        let result = reply.get("result").cloned().unwrap_or(Value::Null);
        if result.get("success").and_then(Value::as_bool) == Some(true) {
            let payload = result.get("payload").cloned().unwrap_or(Value::Null);
            if let Some(s) = payload.get("sessionId").and_then(Value::as_str) {
                current_session = Some(s.to_string());
            }
            println!("< {}", payload.get("reply").and_then(Value::as_str).unwrap_or("").trim());
        } else {
            let message = result
                .get("error")
                .or_else(|| reply.get("error"))
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("chat failed");
            eprintln!("chat error: {}", message);
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}

/// Open the streaming channel and consume the hello frame.
async fn connect(config_path: Option<std::path::PathBuf>) -> anyhow::Result<WsStream> {
    let (config, _) = portico::config::load_config(config_path)?;
    let bind = match config.gateway.bind.trim() {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    };
    let ws_url = format!("ws://{}:{}/ws", bind, config.gateway.port);
    let mut request = ws_url.as_str().into_client_request()?;
    if let Some(token) = portico::config::resolve_gateway_token(&config) {
        request
            .headers_mut()
            .insert("Authorization", HeaderValue::from_str(&format!("Bearer {}", token))?);
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("connecting to {}", ws_url))?;

    let first = ws.next().await.context("connection closed before hello")??;
    let Message::Text(text) = first else {
        anyhow::bail!("expected text hello frame");
    };
    let hello: Value = serde_json::from_str(&text)?;
    if hello.get("type").and_then(Value::as_str) != Some("hello") {
        anyhow::bail!("expected hello frame, got {}", text);
    }
    log::debug!(
        "connected as {}",
        hello.get("connectionId").and_then(Value::as_str).unwrap_or("?")
    );
    Ok(ws)
}

/// Send one frame and wait for the reply carrying the same id. Ticks are skipped.
async fn request(ws: &mut WsStream, frame: Value, id: &str) -> anyhow::Result<Value> {
    ws.send(Message::Text(frame.to_string())).await?;
    while let Some(msg) = ws.next().await {
        let Message::Text(text) = msg? else { continue };
        let reply: Value = serde_json::from_str(&text)?;
        match reply.get("type").and_then(Value::as_str) {
            Some("shutdown") => anyhow::bail!("gateway is shutting down"),
            Some("command_response") | Some("chat_response") | Some("error")
                if reply.get("id").and_then(Value::as_str) == Some(id) =>
            {
                return Ok(reply);
            }
            _ => continue,
        }
    }
    anyhow::bail!("connection closed before reply")
}
