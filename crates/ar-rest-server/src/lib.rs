// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! agent-relay server: exposes local worker-CLI agents over the A2A
//! JSON-RPC/REST protocol with authentication, budgets, rate caps,
//! and durable task/session state.

pub mod auth;
pub mod budget;
pub mod config;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod revocation;
pub mod server;
pub mod state;
pub mod tokens;

pub use config::{AgentDefinition, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use server::Server;
pub use state::AppState;
