// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Admin surface: token lifecycle, session management, stats.
//! Every endpoint requires the shared-secret tier.

use crate::auth::AuthContext;
use crate::budget::BudgetSnapshot;
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use crate::tokens::IssueRequest;
use ar_local_db::{RevokedTokenRecord, SessionRecord};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

fn require_admin(state: &AppState, headers: &HeaderMap) -> ServerResult<AuthContext> {
    let auth = state.authorize(headers)?;
    if !auth.is_admin() {
        return Err(ServerError::ScopeDenied { agent: "admin".to_string() });
    }
    Ok(auth)
}

fn token_service(state: &AppState) -> ServerResult<&std::sync::Arc<crate::tokens::TokenService>> {
    state.tokens.as_ref().ok_or_else(|| {
        ServerError::BadRequest("token issuance requires a configured jwt secret".to_string())
    })
}

/// `POST /admin/tokens` response.
#[derive(Serialize)]
pub struct IssueTokenResponse {
    pub access_token: String,
    pub jti: String,
    pub expires_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// `POST /admin/tokens`
pub async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IssueRequest>,
) -> ServerResult<Json<IssueTokenResponse>> {
    require_admin(&state, &headers)?;
    let tokens = token_service(&state)?;

    let (access_token, claims) = tokens
        .issue_access(&request)
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    let refresh_token = if state.config.refresh_enabled {
        let (refresh, _) = tokens
            .issue_refresh(&request)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        Some(refresh)
    } else {
        None
    };

    tracing::info!(client = %request.client_name, jti = %claims.jti, "issued token");
    Ok(Json(IssueTokenResponse {
        access_token,
        jti: claims.jti,
        expires_at: claims.exp,
        refresh_token,
    }))
}

/// `DELETE /admin/tokens/:jti`
pub async fn revoke_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(jti): Path<String>,
) -> ServerResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    state.revocations.revoke(&jti)?;
    tracing::info!(%jti, "revoked token");
    Ok(Json(serde_json::json!({ "revoked": jti })))
}

/// `GET /admin/tokens/revoked`
pub async fn list_revoked(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Json<Vec<RevokedTokenRecord>>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.revocations.list()?))
}

/// `POST /admin/tokens/refresh` request body.
#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// `POST /admin/tokens/refresh`
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> ServerResult<Json<IssueTokenResponse>> {
    require_admin(&state, &headers)?;
    if !state.config.refresh_enabled {
        return Err(ServerError::BadRequest("refresh tokens are disabled".to_string()));
    }
    let tokens = token_service(&state)?;

    let (access_token, claims) = tokens.refresh(&request.refresh_token).map_err(|e| {
        ServerError::AuthInvalid { detail: state.config.token_debug.then(|| e.to_string()) }
    })?;

    Ok(Json(IssueTokenResponse {
        access_token,
        jti: claims.jti,
        expires_at: claims.exp,
        refresh_token: None,
    }))
}

/// Filter for `GET /admin/sessions`.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub client: Option<String>,
}

/// `GET /admin/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> ServerResult<Json<Vec<SessionRecord>>> {
    require_admin(&state, &headers)?;
    let sessions = match query.client {
        Some(client) => state.registry.list_for_client(&client),
        None => state.registry.list_all(),
    };
    Ok(Json(sessions))
}

/// `DELETE /admin/sessions/:id` — destroys the worker too.
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ServerResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;

    let Some(record) = state.registry.delete(&session_id)? else {
        return Err(ServerError::SessionNotFound(session_id));
    };
    let destroyed = state.pool.destroy_session(&record.context_id).await;
    tracing::info!(%session_id, destroyed, "admin deleted session");
    Ok(Json(serde_json::json!({ "deleted": session_id, "worker_destroyed": destroyed })))
}

/// `GET /admin/stats` response.
#[derive(Serialize)]
pub struct StatsResponse {
    pub active_processes: usize,
    pub active_sessions: usize,
    pub enabled_agents: Vec<String>,
    pub budget: BudgetSnapshot,
}

/// `GET /admin/stats`
pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Json<StatsResponse>> {
    require_admin(&state, &headers)?;
    Ok(Json(StatsResponse {
        active_processes: state.pool.len(),
        active_sessions: state.registry.count(),
        enabled_agents: state.config.enabled_agents().map(|a| a.name.clone()).collect(),
        budget: state.budget.snapshot()?,
    }))
}
