// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! REST mirror of the JSON-RPC surface.

use crate::error::ServerResult;
use crate::state::AppState;
use ar_a2a_contract::{Message, MessageSendParams, Task};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

/// `POST /a2a/rest/message/send`
pub async fn message_send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<MessageSendParams>,
) -> ServerResult<Json<Message>> {
    let auth = state.authorize(&headers)?;
    let message = state.orchestrator.message_send(&auth, params).await?;
    Ok(Json(message))
}

/// `GET /a2a/rest/tasks/:id`
pub async fn task_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ServerResult<Json<Task>> {
    let auth = state.authorize(&headers)?;
    let task = state.orchestrator.task_get(&auth, &task_id)?;
    Ok(Json(task))
}

/// `POST /a2a/rest/tasks/:id/cancel`
pub async fn task_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ServerResult<Json<Task>> {
    let auth = state.authorize(&headers)?;
    let task = state.orchestrator.cancel_task(&auth, &task_id).await?;
    Ok(Json(task))
}
