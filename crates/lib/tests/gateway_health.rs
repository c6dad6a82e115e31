//! Integration test: request/response transport over a real socket.
//! Does not require Ollama; the portal is scripted.

mod common;

use common::{start, test_config};
use portico::config::GatewayAuthMode;
use serde_json::{json, Value};

#[tokio::test]
async fn gateway_health_http_responds_with_running() {
    let gw = start(test_config()).await;
    let client = reqwest::Client::new();

    for path in ["/", "/health"] {
        let resp = client.get(gw.http(path)).send().await.expect("GET health");
        assert!(resp.status().is_success());
        let json: Value = resp.json().await.expect("parse JSON");
        assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
        assert_eq!(json.get("protocol").and_then(|v| v.as_u64()), Some(1));
        assert_eq!(json.get("connections").and_then(|v| v.as_u64()), Some(0));
        let caps = json["capabilities"].as_array().expect("capabilities array");
        assert!(caps.iter().any(|c| c == "echo"));
    }
    gw.stop().await;
}

#[tokio::test]
async fn command_echo_round_trip() {
    let gw = start(test_config()).await;
    let resp = reqwest::Client::new()
        .post(gw.http("/command"))
        .json(&json!({ "name": "echo", "parameters": { "text": "x" } }))
        .send()
        .await
        .expect("POST /command");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["payload"], "x");
    assert!(body.get("error").is_none());
    assert!(body["elapsedMillis"].is_u64());
    gw.stop().await;
}

#[tokio::test]
async fn command_errors_map_to_status_codes() {
    let gw = start(test_config()).await;
    let client = reqwest::Client::new();

    let missing = client
        .post(gw.http("/command"))
        .json(&json!({ "name": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["kind"], "NOT_FOUND");

    let malformed = client
        .post(gw.http("/command"))
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);
    let body: Value = malformed.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "BAD_INPUT");

    let bad_params = client
        .post(gw.http("/command"))
        .json(&json!({ "name": "echo", "parameters": { "text": 1 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_params.status(), 400);
    gw.stop().await;
}

#[tokio::test]
async fn oversized_body_gets_result_envelope() {
    let gw = start(test_config()).await;
    let text = "x".repeat(3 * 1024 * 1024);
    let resp = reqwest::Client::new()
        .post(gw.http("/command"))
        .json(&json!({ "name": "echo", "parameters": { "text": text } }))
        .send()
        .await
        .expect("POST /command");
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.expect("JSON envelope");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["kind"], "BAD_INPUT");

    // Same client, normal body, still served.
    let ok = reqwest::Client::new()
        .post(gw.http("/command"))
        .json(&json!({ "name": "echo", "parameters": { "text": "small" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    gw.stop().await;
}

#[tokio::test]
async fn command_requires_bearer_token_when_auth_enabled() {
    let mut config = test_config();
    config.gateway.auth.mode = GatewayAuthMode::Token;
    config.gateway.auth.token = Some("s3cret".to_string());
    let gw = start(config).await;
    let client = reqwest::Client::new();
    let envelope = json!({ "name": "echo", "parameters": { "text": "hi" } });

    let anonymous = client.post(gw.http("/command")).json(&envelope).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);
    let body: Value = anonymous.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "UNAUTHORIZED");

    let wrong = client
        .post(gw.http("/command"))
        .bearer_auth("guess")
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let ok = client
        .post(gw.http("/command"))
        .bearer_auth("s3cret")
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    // Health stays open.
    let health = client.get(gw.http("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    gw.stop().await;
}

#[tokio::test]
async fn command_is_rate_limited_per_client() {
    let mut config = test_config();
    config.gateway.rate_limit.max_requests = 2;
    config.gateway.rate_limit.window_ms = 60_000;
    let gw = start(config).await;
    let client = reqwest::Client::new();
    let envelope = json!({ "name": "echo", "parameters": { "text": "hi" } });

    for _ in 0..2 {
        let resp = client.post(gw.http("/command")).json(&envelope).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }
    let limited = client.post(gw.http("/command")).json(&envelope).send().await.unwrap();
    assert_eq!(limited.status(), 429);
    let body: Value = limited.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "RATE_LIMITED");

    let health = client.get(gw.http("/")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    gw.stop().await;
}

#[tokio::test]
async fn disallowed_origin_is_rejected() {
    let mut config = test_config();
    config.gateway.allowed_origins = vec!["http://localhost:3000".to_string()];
    let gw = start(config).await;
    let client = reqwest::Client::new();
    let envelope = json!({ "name": "echo", "parameters": { "text": "hi" } });

    let denied = client
        .post(gw.http("/command"))
        .header("Origin", "http://evil.example")
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 400);

    let allowed = client
        .post(gw.http("/command"))
        .header("Origin", "http://localhost:3000")
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    gw.stop().await;
}
