// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Server assembly: startup checks, router construction, background
//! timers, and graceful shutdown.

use crate::auth::AuthGate;
use crate::budget::BudgetTracker;
use crate::config::ServerConfig;
use crate::handlers;
use crate::orchestrator::{record_to_task, task_to_record, RequestOrchestrator};
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;
use crate::revocation::RevocationCache;
use crate::state::AppState;
use crate::tokens::TokenService;
use ar_a2a_contract::{Message, TaskState, TaskStatus};
use ar_local_db::{migrate_legacy_state, Database, TaskAccess, TaskStore};
use ar_worker::{SessionPool, SessionPoolOptions};
use axum::{
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// The assembled A2A server.
pub struct Server {
    state: AppState,
    router: Router,
    timers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Build the full server: open and migrate the durable store,
    /// hydrate caches, and wire the request pipeline. Startup failures
    /// here are fatal by design.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.ensure_bind_safe().map_err(|e| anyhow::anyhow!(e))?;
        Self::check_startup_paths(&config)?;

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.workdir())?;

        let config = Arc::new(config);
        let db = Arc::new(Database::open(config.database_path())?);
        migrate_legacy_state(&db, &config.data_dir)?;

        let registry = Arc::new(SessionRegistry::load(
            Arc::clone(&db),
            config.max_sessions_per_client,
        )?);
        let revocations = Arc::new(RevocationCache::load(Arc::clone(&db))?);

        let tokens = match &config.jwt_secret {
            Some(secret) => Some(Arc::new(
                TokenService::new(
                    secret,
                    &config.jwt_algorithm,
                    config.access_token_ttl_secs,
                    config.refresh_token_ttl_secs,
                    Arc::clone(&revocations),
                )
                .map_err(|e| anyhow::anyhow!(e))?,
            )),
            None => None,
        };

        let pool = Arc::new(SessionPool::new(SessionPoolOptions {
            max_concurrent: config.max_concurrent_sessions,
            request_timeout: config.request_timeout,
        }));
        let budget = Arc::new(BudgetTracker::new(
            Arc::clone(&db),
            config.global_daily_limit_usd,
            config.default_client_daily_limit_usd,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.default_rpm, config.burst));
        let auth_gate = Arc::new(AuthGate::new(
            config.master_key.clone(),
            tokens.clone(),
            config.token_debug,
        ));
        let orchestrator = Arc::new(RequestOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&db),
            Arc::clone(&pool),
            Arc::clone(&registry),
            Arc::clone(&budget),
        ));

        let state = AppState {
            config: Arc::clone(&config),
            db,
            pool,
            registry,
            budget,
            rate_limiter,
            auth_gate,
            tokens,
            revocations,
            orchestrator,
            started_at: Instant::now(),
        };

        let router = Self::build_router(state.clone());
        let timers = Self::start_timers(&state);

        Ok(Self { state, router, timers })
    }

    /// Missing worker binary or agent work-dir is a fatal startup
    /// error (exit code 1), not a runtime reply.
    fn check_startup_paths(config: &ServerConfig) -> anyhow::Result<()> {
        let binary = &config.worker_binary;
        let found = if binary.components().count() > 1 {
            binary.exists()
        } else {
            std::env::var_os("PATH").is_some_and(|path| {
                std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
            })
        };
        if !found {
            anyhow::bail!("worker binary not found: {}", binary.display());
        }
        for agent in &config.agents {
            if let Some(dir) = &agent.working_dir {
                if !dir.is_dir() {
                    anyhow::bail!(
                        "working directory for agent '{}' does not exist: {}",
                        agent.name,
                        dir.display()
                    );
                }
            }
        }
        Ok(())
    }

    fn build_router(state: AppState) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(if state.config.enable_cors {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new()
                    .allow_origin(vec![
                        HeaderValue::from_static("http://localhost:3000"),
                        HeaderValue::from_static("http://127.0.0.1:3000"),
                    ])
                    .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                    .allow_headers([
                        axum::http::header::AUTHORIZATION,
                        axum::http::header::CONTENT_TYPE,
                    ])
            });

        Router::new()
            // A2A surface
            .route("/a2a/jsonrpc", post(handlers::jsonrpc::jsonrpc))
            .route("/a2a/rest/message/send", post(handlers::rest::message_send))
            .route("/a2a/rest/tasks/:id", get(handlers::rest::task_get))
            .route("/a2a/rest/tasks/:id/cancel", post(handlers::rest::task_cancel))
            // Discovery and health
            .route("/.well-known/agent-card.json", get(handlers::card::agent_card))
            .route("/health", get(handlers::health::health))
            // Admin surface
            .route("/admin/tokens", post(handlers::admin::issue_token))
            .route("/admin/tokens/refresh", post(handlers::admin::refresh_token))
            .route("/admin/tokens/revoked", get(handlers::admin::list_revoked))
            .route("/admin/tokens/:jti", delete(handlers::admin::revoke_token))
            .route("/admin/sessions", get(handlers::admin::list_sessions))
            .route("/admin/sessions/:id", delete(handlers::admin::delete_session))
            .route("/admin/stats", get(handlers::admin::stats))
            .with_state(state)
            .layer(middleware)
    }

    fn start_timers(state: &AppState) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(state.config.sweep_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    match state
                        .registry
                        .sweep(state.config.session_max_idle, state.config.session_max_lifetime)
                    {
                        Ok(victims) => {
                            for victim in victims {
                                state.pool.destroy_session(&victim.context_id).await;
                            }
                        }
                        Err(e) => warn!(error = %e, "session sweep failed"),
                    }
                    state.rate_limiter.prune_stale();
                }
            })
        };
        vec![sweeper]
    }

    /// Shared state, for tests and the shutdown path.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Router clone, for in-process testing via `tower::ServiceExt`.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until an OS termination signal, then drain gracefully
    /// within the configured deadline.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.state.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Like [`Server::run`] but with a pre-bound listener (tests bind
    /// port 0).
    pub async fn run_with_listener(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, agents = self.state.config.agents.len(), "agent-relay listening");

        let Self { state, router, timers } = self;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("shutdown signal received, draining");
        let deadline = state.config.shutdown_deadline;
        if tokio::time::timeout(deadline, graceful_shutdown(&state, timers)).await.is_err() {
            warn!("graceful shutdown exceeded {deadline:?}, forcing exit");
            std::process::exit(0);
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("sigterm handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// The ordered drain: annotate in-flight tasks, release (never kill)
/// the workers, persist their PIDs, mark every session's process dead,
/// and stop the timers. The database closes when the last handle
/// drops.
pub async fn graceful_shutdown(state: &AppState, timers: Vec<JoinHandle<()>>) {
    for (task_id, context_id) in state.pool.live_tasks() {
        let annotated = annotate_restarting_task(state, &task_id, &context_id);
        if let Err(e) = annotated {
            warn!(task_id = %task_id, error = %e, "failed to annotate in-flight task");
        }
    }

    let released = state.pool.release_all().await;
    for (context_id, pid) in &released {
        if let Some(pid) = pid {
            let _ = state.registry.save_pid(context_id, i64::from(*pid));
        }
    }
    if let Err(e) = state.registry.mark_all_dead() {
        warn!(error = %e, "failed to mark sessions dead");
    }

    for timer in timers {
        timer.abort();
    }
    info!(released = released.len(), "graceful shutdown complete");
}

/// In-flight tasks keep state `working` but gain a status message
/// telling the caller how to recover after the restart.
fn annotate_restarting_task(
    state: &AppState,
    task_id: &str,
    context_id: &str,
) -> anyhow::Result<()> {
    let record = {
        let conn = state.db.lock()?;
        TaskStore::new(&conn).load(task_id, &TaskAccess::Internal)?
    };
    let Some(record) = record else {
        return Ok(());
    };
    if record.status_state != TaskState::Working.as_str() {
        return Ok(());
    }

    let mut task = record_to_task(record).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    task.status = TaskStatus::new(TaskState::Working).with_message(Message::agent_text(
        "The server is restarting. Reconnect with the same contextId to retrieve results.",
        Some(context_id.to_string()),
    ));
    let record = task_to_record(&task).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let conn = state.db.lock()?;
    TaskStore::new(&conn).save(&record, &TaskAccess::Internal)?;
    Ok(())
}
