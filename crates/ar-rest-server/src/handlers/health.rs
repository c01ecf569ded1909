// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Public health endpoint. Unauthenticated by design.

use crate::budget::BudgetSnapshot;
use crate::error::ServerResult;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

/// `GET /health` response body.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub uptime_seconds: u64,
    /// Live worker processes owned by the pool.
    pub active_processes: usize,
    /// Persisted session rows (may exceed live processes).
    pub active_sessions: usize,
    pub budget: BudgetSnapshot,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> ServerResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        active_processes: state.pool.len(),
        active_sessions: state.registry.count(),
        budget: state.budget.snapshot()?,
    }))
}
