// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared test scaffolding: a mock worker script and router helpers.
#![allow(dead_code)]

use ar_rest_server::{AgentDefinition, Server, ServerConfig};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

pub const MASTER_KEY: &str = "master-secret";
pub const JWT_SECRET: &str = "jwt-test-secret";

/// Executable mock worker speaking the stream-JSON protocol.
pub fn write_mock_worker(dir: &Path) -> PathBuf {
    let script = r#"#!/bin/sh
sid="mock-$$"
first=1
while IFS= read -r line; do
  if [ "$first" = 1 ]; then
    printf '{"type":"system","subtype":"init","session_id":"%s","model":"mock-model"}\n' "$sid"
    first=0
  fi
  printf '{"type":"result","subtype":"success","is_error":false,"result":"mock reply","session_id":"%s","duration_ms":7,"duration_api_ms":4,"num_turns":1,"total_cost_usd":0.01,"usage":{"input_tokens":3,"output_tokens":2,"cache_creation_input_tokens":0,"cache_read_input_tokens":1},"permission_denials":[]}\n' "$sid"
done
"#;
    let path = dir.join("mock-worker.sh");
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn agent(name: &str, scopes: &[&str]) -> AgentDefinition {
    AgentDefinition {
        name: name.to_string(),
        description: format!("{name} agent"),
        enabled: true,
        model: None,
        system_prompt_suffix: None,
        settings_file: None,
        permission_mode: None,
        allowed_tools: vec![],
        max_cost_usd: None,
        required_scopes: scopes.iter().map(|s| s.to_string()).collect(),
        working_dir: None,
    }
}

pub fn test_config(dir: &TempDir) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.data_dir = dir.path().join("data");
    config.worker_binary = write_mock_worker(dir.path());
    config.master_key = Some(MASTER_KEY.to_string());
    config.jwt_secret = Some(JWT_SECRET.to_string());
    config.refresh_enabled = true;
    config.default_client_daily_limit_usd = 1.0;
    config.request_timeout = Duration::from_secs(10);
    config.default_rpm = 6000;
    config.burst = 1000;
    config.agents = vec![agent("general", &[]), agent("code", &["code"])];
    config
}

pub async fn spawn_server(dir: &TempDir) -> Server {
    Server::new(test_config(dir)).await.expect("server construction")
}

/// One in-process HTTP round trip.
pub async fn http(
    router: &Router,
    method: &str,
    path: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(path);
    if let Some(token) = bearer {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// JSON-RPC `message/send` round trip; returns (status, full response).
pub async fn rpc_send(
    router: &Router,
    bearer: Option<&str>,
    parts: Value,
    context_id: Option<&str>,
    metadata: Option<Value>,
) -> (StatusCode, Value) {
    let mut message = json!({
        "messageId": uuid_like(),
        "role": "user",
        "parts": parts,
    });
    if let Some(context_id) = context_id {
        message["contextId"] = json!(context_id);
    }
    if let Some(metadata) = metadata {
        message["metadata"] = metadata;
    }

    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "message/send",
        "params": {
            "message": message,
            "configuration": {"blocking": true}
        }
    });
    http(router, "POST", "/a2a/jsonrpc", bearer, Some(body)).await
}

pub async fn rpc_call(
    router: &Router,
    bearer: Option<&str>,
    method: &str,
    params: Value,
) -> (StatusCode, Value) {
    let body = json!({"jsonrpc": "2.0", "id": 2, "method": method, "params": params});
    http(router, "POST", "/a2a/jsonrpc", bearer, Some(body)).await
}

/// Mint an access token for a client through the admin surface.
pub async fn mint_token(router: &Router, client: &str, scopes: &[&str]) -> String {
    let (status, body) = http(
        router,
        "POST",
        "/admin/tokens",
        Some(MASTER_KEY),
        Some(json!({"client_name": client, "scopes": scopes})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "token mint failed: {body}");
    body["access_token"].as_str().unwrap().to_string()
}

fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("msg-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
