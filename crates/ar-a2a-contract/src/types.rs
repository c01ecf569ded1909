// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! A2A message, task, and agent-card schema types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// Binary or referenced file payload inside a file part.
///
/// Exactly one of `bytes` (base64) or `uri` is expected; both are kept
/// optional because remote agents are not always well behaved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// One part of a message. The A2A schema tags parts by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
    File { file: FileContent },
    Data { data: Value },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }
}

/// A single message exchanged between a remote agent and this server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Message {
    /// Build an agent-authored text reply.
    pub fn agent_text(text: impl Into<String>, context_id: Option<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            role: Role::Agent,
            parts: vec![Part::text(text)],
            context_id,
            task_id: None,
            metadata: None,
        }
    }

    /// Attach a metadata entry, creating the map on first use.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.get_or_insert_with(HashMap::new).insert(key.into(), value);
        self
    }
}

/// Task lifecycle states defined by the A2A protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
}

impl TaskState {
    /// States from which a task can still be canceled.
    pub fn is_cancelable(self) -> bool {
        matches!(self, TaskState::Submitted | TaskState::Working | TaskState::InputRequired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input-required",
            TaskState::Completed => "completed",
            TaskState::Canceled => "canceled",
            TaskState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(TaskState::Submitted),
            "working" => Ok(TaskState::Working),
            "input-required" => Ok(TaskState::InputRequired),
            "completed" => Ok(TaskState::Completed),
            "canceled" => Ok(TaskState::Canceled),
            "failed" => Ok(TaskState::Failed),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Status snapshot of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            message: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }
}

/// An artifact produced while working a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub parts: Vec<Part>,
}

/// A durable A2A task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub context_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Message>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Task {
    pub fn new(id: impl Into<String>, context_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            id: id.into(),
            context_id: context_id.into(),
            status: TaskStatus::new(state),
            artifacts: None,
            history: None,
            metadata: None,
        }
    }
}

/// Parameters of the `message/send` JSON-RPC method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSendParams {
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<MessageSendConfiguration>,
}

/// Per-call configuration for `message/send`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageSendConfiguration {
    #[serde(default)]
    pub blocking: bool,
}

/// Parameters of `tasks/get` and `tasks/cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdParams {
    pub id: String,
}

/// Usage accounting reported by the worker for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// The `metadata.claude` envelope attached to every successful reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMetadata {
    pub agent: String,
    pub session_id: String,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub duration_api_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    pub num_turns: u32,
    pub usage: TokenUsage,
    pub permission_denials: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// One advertised skill on the agent card.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// Declared protocol capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push_notifications: bool,
}

/// Public discovery document served at `/.well-known/agent-card.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub version: String,
    pub url: String,
    pub capabilities: AgentCapabilities,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
    pub skills: Vec<AgentSkill>,
    pub security_schemes: HashMap<String, Value>,
}

/// Input MIME types every agent on this server accepts.
pub const SUPPORTED_INPUT_MODES: &[&str] = &[
    "text",
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "application/pdf",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_kind_tagging_round_trips() {
        let part = Part::Text { text: "hello".into() };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hello");
        let back: Part = serde_json::from_value(json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn task_state_uses_kebab_case() {
        let json = serde_json::to_value(TaskState::InputRequired).unwrap();
        assert_eq!(json, "input-required");
        assert_eq!("input-required".parse::<TaskState>().unwrap(), TaskState::InputRequired);
    }

    #[test]
    fn terminal_states_are_not_cancelable() {
        assert!(TaskState::Working.is_cancelable());
        assert!(!TaskState::Completed.is_cancelable());
        assert!(!TaskState::Failed.is_cancelable());
        assert!(!TaskState::Canceled.is_cancelable());
    }

    #[test]
    fn message_metadata_builder_creates_map() {
        let msg = Message::agent_text("hi", None)
            .with_metadata("orphan_pid", serde_json::json!(1234));
        assert_eq!(msg.metadata.unwrap()["orphan_pid"], 1234);
    }

    #[test]
    fn file_part_with_uri_only_parses() {
        let json = serde_json::json!({
            "kind": "file",
            "file": {"uri": "https://example.com/doc.pdf", "mimeType": "application/pdf"}
        });
        let part: Part = serde_json::from_value(json).unwrap();
        match part {
            Part::File { file } => {
                assert_eq!(file.uri.as_deref(), Some("https://example.com/doc.pdf"));
                assert!(file.bytes.is_none());
            }
            other => panic!("expected file part, got {other:?}"),
        }
    }
}
