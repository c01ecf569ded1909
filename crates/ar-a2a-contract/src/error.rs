// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Problem-details error body shared by the HTTP surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// RFC 7807 style error body returned for HTTP-level failures
/// (authentication, rate limiting, malformed requests).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub detail: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, Vec<String>>,
}

impl ProblemDetails {
    pub fn new(problem_type: &str, title: &str, status: u16, detail: impl Into<String>) -> Self {
        Self {
            problem_type: format!("https://agent-relay.dev/errors/{problem_type}"),
            title: title.to_string(),
            status: Some(status),
            detail: detail.into(),
            errors: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_errors_map_is_omitted() {
        let problem = ProblemDetails::new("auth", "Authentication Failed", 401, "bad token");
        let json = serde_json::to_value(&problem).unwrap();
        assert!(json.get("errors").is_none());
        assert_eq!(json["type"], "https://agent-relay.dev/errors/auth");
        assert_eq!(json["status"], 401);
    }
}
