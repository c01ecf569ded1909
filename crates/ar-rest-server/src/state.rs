// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared server state.

use crate::auth::{AuthContext, AuthGate};
use crate::budget::BudgetTracker;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::orchestrator::RequestOrchestrator;
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;
use crate::revocation::RevocationCache;
use crate::tokens::TokenService;
use ar_local_db::Database;
use ar_worker::SessionPool;
use axum::http::{header, HeaderMap};
use std::sync::Arc;
use std::time::Instant;

/// Shared application state, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: Arc<Database>,
    pub pool: Arc<SessionPool>,
    pub registry: Arc<SessionRegistry>,
    pub budget: Arc<BudgetTracker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth_gate: Arc<AuthGate>,
    pub tokens: Option<Arc<TokenService>>,
    pub revocations: Arc<RevocationCache>,
    pub orchestrator: Arc<RequestOrchestrator>,
    pub started_at: Instant,
}

impl AppState {
    /// Authenticate and rate-limit one request. Every API handler
    /// funnels through here before touching the orchestrator.
    pub fn authorize(&self, headers: &HeaderMap) -> ServerResult<AuthContext> {
        let bearer = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        let auth = self.auth_gate.authenticate(bearer)?;
        self.rate_limiter
            .check(&auth.client_name, auth.rate_override)
            .map_err(|retry_after_secs| ServerError::RateLimited { retry_after_secs })?;
        Ok(auth)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
