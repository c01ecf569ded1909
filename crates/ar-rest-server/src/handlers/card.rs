// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Public agent-card discovery document.

use crate::state::AppState;
use ar_a2a_contract::{AgentCapabilities, AgentCard, AgentSkill, SUPPORTED_INPUT_MODES};
use axum::{extract::State, Json};
use serde_json::json;
use std::collections::HashMap;

/// `GET /.well-known/agent-card.json`
pub async fn agent_card(State(state): State<AppState>) -> Json<AgentCard> {
    let skills = state
        .config
        .enabled_agents()
        .map(|agent| AgentSkill {
            id: agent.name.clone(),
            name: agent.name.clone(),
            description: if agent.description.is_empty() {
                format!("Conversational agent '{}'", agent.name)
            } else {
                agent.description.clone()
            },
            tags: vec!["conversation".to_string()],
        })
        .collect();

    Json(AgentCard {
        name: "agent-relay".to_string(),
        description: "Worker-CLI agents exposed over the A2A protocol".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        url: format!("http://{}/a2a/jsonrpc", state.config.bind_addr),
        capabilities: AgentCapabilities { streaming: false, push_notifications: false },
        default_input_modes: SUPPORTED_INPUT_MODES.iter().map(|m| m.to_string()).collect(),
        default_output_modes: vec!["text".to_string()],
        skills,
        security_schemes: HashMap::from([(
            "bearer".to_string(),
            json!({"type": "http", "scheme": "bearer"}),
        )]),
    })
}
