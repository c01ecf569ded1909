// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Graceful shutdown: release without kill, PID persistence, restart
//! recovery.

mod common;

use ar_rest_server::server::graceful_shutdown;
use ar_worker::process::{is_pid_alive, signal_group};
use common::*;
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn shutdown_releases_workers_and_persists_pids() {
    let dir = TempDir::new().unwrap();
    let server = spawn_server(&dir).await;
    let router = server.router();

    let (_, sent) = rpc_send(
        &router,
        Some(MASTER_KEY),
        json!([{"kind": "text", "text": "long conversation"}]),
        None,
        None,
    )
    .await;
    let context_id = sent["result"]["contextId"].as_str().unwrap().to_string();

    let worker_pid = {
        let session = server.state().pool.get(&context_id).expect("live session");
        session.pid().unwrap() as i64
    };
    assert!(is_pid_alive(worker_pid));

    graceful_shutdown(server.state(), vec![]).await;

    // The pool is empty but the orphaned worker lives on.
    assert_eq!(server.state().pool.len(), 0);
    assert!(is_pid_alive(worker_pid));

    // The durable row kept the PID and lost its process-alive flag.
    let record = server.state().registry.peek_by_context_id(&context_id).expect("session row");
    assert!(!record.process_alive);
    assert_eq!(record.last_pid, Some(worker_pid));

    // A restarted server detects the orphan for the same context.
    drop(server);
    let server = ar_rest_server::Server::new(test_config(&dir)).await.unwrap();
    let router = server.router();

    let (_, reply) = rpc_send(
        &router,
        Some(MASTER_KEY),
        json!([{"kind": "text", "text": "anyone home?"}]),
        Some(&context_id),
        None,
    )
    .await;
    assert_eq!(reply["result"]["metadata"]["error_type"], "orphan_still_running");
    assert_eq!(reply["result"]["metadata"]["orphan_pid"], json!(worker_pid));

    signal_group(worker_pid, libc::SIGKILL);
}

#[tokio::test]
async fn shutdown_with_no_sessions_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let server = spawn_server(&dir).await;

    graceful_shutdown(server.state(), vec![]).await;
    assert_eq!(server.state().pool.len(), 0);
    assert_eq!(server.state().registry.count(), 0);
}
