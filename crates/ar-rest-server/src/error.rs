// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Server error types and their HTTP rendering.

use ar_a2a_contract::ProblemDetails;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

/// Server result type.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that escape as HTTP statuses. Protocol-recoverable failures
/// (capacity, busy, timeout, budget, agent resolution, orphan) never
/// appear here — the orchestrator folds them into reply messages.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("missing bearer credential")]
    AuthMissing,

    #[error("invalid credential")]
    AuthInvalid { detail: Option<String> },

    #[error("token has been revoked")]
    AuthRevoked,

    #[error("refresh tokens are not accepted here")]
    RefreshUsedAsAccess,

    #[error("caller lacks a scope required by agent '{agent}'")]
    ScopeDenied { agent: String },

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("task not found")]
    TaskNotFound,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("task is not cancelable")]
    TaskNotCancelable,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("database error: {0}")]
    Database(#[from] ar_local_db::DbError),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::AuthMissing
            | ServerError::AuthInvalid { .. }
            | ServerError::AuthRevoked
            | ServerError::RefreshUsedAsAccess => StatusCode::UNAUTHORIZED,
            ServerError::ScopeDenied { .. } => StatusCode::FORBIDDEN,
            ServerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServerError::TaskNotFound | ServerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::TaskNotCancelable | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Database(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Body shown to callers. Internal causes are never leaked.
    pub fn to_problem(&self) -> ProblemDetails {
        match self {
            ServerError::AuthMissing => ProblemDetails::new(
                "auth",
                "Authentication Required",
                401,
                "missing bearer credential",
            ),
            ServerError::AuthInvalid { detail } => ProblemDetails::new(
                "auth",
                "Authentication Failed",
                401,
                match detail {
                    Some(detail) => format!("invalid credential: {detail}"),
                    None => "invalid credential".to_string(),
                },
            ),
            ServerError::AuthRevoked => {
                ProblemDetails::new("auth", "Authentication Failed", 401, "token has been revoked")
            }
            ServerError::RefreshUsedAsAccess => ProblemDetails::new(
                "auth",
                "Authentication Failed",
                401,
                "refresh tokens are not accepted at API endpoints",
            ),
            ServerError::ScopeDenied { agent } => ProblemDetails::new(
                "scope",
                "Scope Denied",
                403,
                format!("caller lacks a scope required by agent '{agent}'"),
            ),
            ServerError::RateLimited { retry_after_secs } => ProblemDetails::new(
                "rate-limited",
                "Rate Limited",
                429,
                format!("too many requests, retry after {retry_after_secs}s"),
            ),
            ServerError::TaskNotFound => {
                ProblemDetails::new("not-found", "Task Not Found", 404, "task not found")
            }
            ServerError::SessionNotFound(id) => ProblemDetails::new(
                "not-found",
                "Session Not Found",
                404,
                format!("session '{id}' not found"),
            ),
            ServerError::TaskNotCancelable => ProblemDetails::new(
                "not-cancelable",
                "Task Not Cancelable",
                400,
                "task is in a terminal state",
            ),
            ServerError::BadRequest(detail) => {
                ProblemDetails::new("bad-request", "Bad Request", 400, detail.clone())
            }
            ServerError::Database(_) | ServerError::Internal(_) => ProblemDetails::new(
                "internal",
                "Internal Server Error",
                500,
                "internal server error",
            ),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Internal(format!("serialization error: {err}"))
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let problem = self.to_problem();
        let mut response = (status, Json(problem)).into_response();
        if let ServerError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
