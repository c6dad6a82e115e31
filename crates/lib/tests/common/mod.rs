//! Shared harness: start the gateway on an ephemeral port with a scripted portal.

#![allow(dead_code)]

use async_trait::async_trait;
use portico::config::Config;
use portico::gateway::{self, GatewayState};
use portico::portal::{ChatMessage, Portal, PortalError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Replies with the last message it was given.
pub struct EchoPortal;

#[async_trait]
impl Portal for EchoPortal {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, PortalError> {
        Ok(messages.last().map(|m| format!("re: {}", m.content)).unwrap_or_default())
    }
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: GatewayState,
    shutdown: Option<oneshot::Sender<()>>,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

impl TestGateway {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Trigger graceful shutdown and wait for the server to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), self.handle).await;
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.gateway.bind = "127.0.0.1".to_string();
    config
}

pub async fn start(config: Config) -> TestGateway {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local_addr");
    let state = gateway::build_state(config, Arc::new(EchoPortal)).expect("build state");
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(gateway::serve(listener, state.clone(), async move {
        let _ = rx.await;
    }));
    TestGateway {
        addr,
        state,
        shutdown: Some(tx),
        handle,
    }
}
