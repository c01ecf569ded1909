// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! The A2A JSON-RPC 2.0 endpoint.
//!
//! Authentication, scope, and rate failures keep their HTTP statuses;
//! task-level failures map to JSON-RPC error codes; everything the
//! orchestrator recovers from arrives as a normal `result` message.

use crate::error::ServerError;
use crate::state::AppState;
use ar_a2a_contract::{codes, JsonRpcRequest, JsonRpcResponse, MessageSendParams, TaskIdParams};
use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

/// `POST /a2a/jsonrpc`
pub async fn jsonrpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let auth = match state.authorize(&headers) {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };
    let id = request.id.clone();

    let result = match request.method.as_str() {
        "message/send" => match serde_json::from_value::<MessageSendParams>(request.params) {
            Ok(params) => state
                .orchestrator
                .message_send(&auth, params)
                .await
                .and_then(|message| Ok(serde_json::to_value(message)?)),
            Err(e) => {
                return Json(JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid message/send params: {e}"),
                ))
                .into_response();
            }
        },
        "tasks/get" => match serde_json::from_value::<TaskIdParams>(request.params) {
            Ok(params) => state
                .orchestrator
                .task_get(&auth, &params.id)
                .and_then(|task| Ok(serde_json::to_value(task)?)),
            Err(e) => {
                return Json(JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid tasks/get params: {e}"),
                ))
                .into_response();
            }
        },
        "tasks/cancel" => match serde_json::from_value::<TaskIdParams>(request.params) {
            Ok(params) => state
                .orchestrator
                .cancel_task(&auth, &params.id)
                .await
                .and_then(|task| Ok(serde_json::to_value(task)?)),
            Err(e) => {
                return Json(JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid tasks/cancel params: {e}"),
                ))
                .into_response();
            }
        },
        other => {
            return Json(JsonRpcResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
            ))
            .into_response();
        }
    };

    match result {
        Ok(value) => Json(JsonRpcResponse::success(id, value)).into_response(),
        Err(err) => error_response(id, err),
    }
}

/// Split [`ServerError`] between HTTP statuses (auth tiers) and
/// JSON-RPC error objects (task-level failures).
fn error_response(id: Value, err: ServerError) -> Response {
    match &err {
        ServerError::AuthMissing
        | ServerError::AuthInvalid { .. }
        | ServerError::AuthRevoked
        | ServerError::RefreshUsedAsAccess
        | ServerError::ScopeDenied { .. }
        | ServerError::RateLimited { .. }
        | ServerError::SessionNotFound(_) => err.into_response(),
        ServerError::TaskNotFound => {
            Json(JsonRpcResponse::error(id, codes::TASK_NOT_FOUND, "task not found"))
                .into_response()
        }
        ServerError::TaskNotCancelable => Json(JsonRpcResponse::error(
            id,
            codes::TASK_NOT_CANCELABLE,
            "task cannot be canceled",
        ))
        .into_response(),
        ServerError::BadRequest(detail) => {
            Json(JsonRpcResponse::error(id, codes::INVALID_PARAMS, detail.clone())).into_response()
        }
        ServerError::Database(_) | ServerError::Internal(_) => {
            tracing::error!(error = %err, "jsonrpc request failed");
            Json(JsonRpcResponse::error(id, codes::INTERNAL_ERROR, "internal error"))
                .into_response()
        }
    }
}
