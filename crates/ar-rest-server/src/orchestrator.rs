// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end request pipeline: resolve the agent, enforce scope and
//! budget, detect live orphans, dispatch to the session pool, and
//! persist task and session state around the exchange.
//!
//! Protocol-recoverable failures (capacity, busy, timeout, budget,
//! agent resolution, orphan detection) are folded into reply messages
//! with an `error_type` metadata tag; only authentication, scope,
//! rate, and tenant failures escape as [`ServerError`].

use crate::auth::AuthContext;
use crate::budget::BudgetTracker;
use crate::config::{AgentDefinition, ServerConfig};
use crate::error::{ServerError, ServerResult};
use crate::registry::SessionRegistry;
use ar_a2a_contract::{
    validation::{validate_incoming_message, ValidationError},
    Message, MessageSendParams, Part, ReplyMetadata, Task, TaskState, TaskStatus, TokenUsage,
};
use ar_local_db::{Database, SessionRecord, TaskAccess, TaskRecord, TaskStore};
use ar_worker::{
    process, ContentBlock, SessionPool, WorkerContent, WorkerError, WorkerLaunchSpec,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// MIME types accepted as image blocks; everything else with bytes
/// becomes a document block.
const IMAGE_MIMES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Bytes of worker stderr included in failure logs.
const STDERR_LOG_BYTES: usize = 500;

/// The per-request pipeline.
pub struct RequestOrchestrator {
    config: Arc<ServerConfig>,
    db: Arc<Database>,
    pool: Arc<SessionPool>,
    registry: Arc<SessionRegistry>,
    budget: Arc<BudgetTracker>,
}

impl RequestOrchestrator {
    pub fn new(
        config: Arc<ServerConfig>,
        db: Arc<Database>,
        pool: Arc<SessionPool>,
        registry: Arc<SessionRegistry>,
        budget: Arc<BudgetTracker>,
    ) -> Self {
        Self { config, db, pool, registry, budget }
    }

    /// Handle `message/send`. The returned message is the agent's
    /// reply or a protocol-level explanation of why no worker ran.
    pub async fn message_send(
        &self,
        auth: &AuthContext,
        params: MessageSendParams,
    ) -> ServerResult<Message> {
        let message = params.message;

        if let Err(e) = validate_incoming_message(&message) {
            let text = match e {
                ValidationError::NotUserRole => "Message role must be 'user'.",
                ValidationError::EmptyMessage => {
                    "Message has no content. Include at least one non-empty part."
                }
            };
            return Ok(protocol_reply(message.context_id.clone(), text, "empty_message"));
        }

        let agent = match self.resolve_agent(&message) {
            Ok(agent) => agent,
            Err(reply) => return Ok(*reply),
        };

        if !auth.satisfies_scopes(&agent.required_scopes) {
            return Err(ServerError::ScopeDenied { agent: agent.name.clone() });
        }

        if let Some(denial) = self.budget.check(&auth.client_name, auth.budget_override)? {
            info!(client = %auth.client_name, %denial, "budget check denied request");
            return Ok(protocol_reply(
                message.context_id.clone(),
                denial.to_string(),
                denial.error_type(),
            ));
        }

        let context_id =
            message.context_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let task_id = message.task_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // A context is pinned to the agent it was first created with;
        // rebinding would let a caller reach an agent its scopes were
        // never checked against.
        let existing = self.registry.peek_by_context_id(&context_id);
        if let Some(record) = &existing {
            if record.agent_name != agent.name {
                return Ok(protocol_reply(
                    Some(context_id),
                    format!(
                        "Context is bound to agent '{}' and cannot be re-used with agent '{}'. \
                         Start a new conversation for a different agent.",
                        record.agent_name, agent.name
                    ),
                    "agent_mismatch",
                ));
            }
        }

        let has_live_session = self.pool.get(&context_id).is_some_and(|s| s.is_alive());

        // A session row without a live process but with a PID that is
        // still alive at the OS level is an orphan from a previous
        // run: do not spawn a second worker over its conversation.
        if !has_live_session {
            if let Some(record) = &existing {
                if !record.process_alive {
                    if let Some(pid) = self.registry.last_pid_durable(&context_id) {
                        if process::is_pid_alive(pid) {
                            warn!(context_id = %context_id, pid, "previous worker still running");
                            let reply = protocol_reply(
                                Some(context_id),
                                format!(
                                    "A worker from a previous server run is still running \
                                     (pid {pid}) for this conversation. Cancel the task or \
                                     wait for it to finish before sending new messages."
                                ),
                                "orphan_still_running",
                            )
                            .with_metadata("orphan_pid", json!(pid));
                            return Ok(reply);
                        }
                    }
                }
            }
        }

        let access = auth.task_access();
        let mut task = Task::new(&task_id, &context_id, TaskState::Working);
        task.history = Some(vec![message.clone()]);
        task.metadata = Some(HashMap::from([("agent".to_string(), json!(agent.name))]));
        self.save_task(&task, &access)?;

        let resume_session_id = existing
            .as_ref()
            .filter(|_| !has_live_session)
            .map(|record| record.session_id.clone());
        let spec = self.launch_spec(agent, resume_session_id);
        let content = convert_parts(&message.parts);

        match self
            .pool
            .send_message(&agent.name, &spec, &content, &context_id, Some(&task_id))
            .await
        {
            Ok(pool_reply) => {
                let reply = pool_reply.reply;
                let pid = pool_reply.pid.map(i64::from);

                self.upsert_session_metadata(auth, agent, &context_id, &task_id, existing, &reply, pid)?;
                self.budget.record_cost(&auth.client_name, reply.total_cost_usd)?;

                let meta = ReplyMetadata {
                    agent: agent.name.clone(),
                    session_id: reply.session_id.clone(),
                    cost_usd: reply.total_cost_usd,
                    duration_ms: reply.duration_ms,
                    duration_api_ms: reply.duration_api_ms,
                    model_used: reply.model.clone(),
                    num_turns: reply.num_turns,
                    usage: TokenUsage {
                        input_tokens: reply.usage.input_tokens,
                        output_tokens: reply.usage.output_tokens,
                        cache_creation_input_tokens: reply.usage.cache_creation_input_tokens,
                        cache_read_input_tokens: reply.usage.cache_read_input_tokens,
                    },
                    permission_denials: reply.permission_denials.clone(),
                    context: Some(context_id.clone()),
                };

                let mut response = Message::agent_text(reply.text, Some(context_id.clone()));
                response.task_id = Some(task_id.clone());
                response = response.with_metadata("claude", serde_json::to_value(&meta)?);
                if !reply.permission_denials.is_empty() {
                    response = response.with_metadata("error_type", json!("permission_denied"));
                }

                task.status = TaskStatus::new(if reply.is_error {
                    TaskState::Failed
                } else {
                    TaskState::Completed
                })
                .with_message(response.clone());
                self.save_task(&task, &access)?;

                Ok(response)
            }
            Err(err) => {
                let (text, error_type) = self.describe_worker_error(&err, &context_id);
                let response = protocol_reply(Some(context_id.clone()), text, error_type);

                task.status = TaskStatus::new(TaskState::Failed).with_message(response.clone());
                self.save_task(&task, &access)?;
                Ok(response)
            }
        }
    }

    /// Handle `tasks/get`. Cross-tenant reads are indistinguishable
    /// from missing tasks.
    pub fn task_get(&self, auth: &AuthContext, task_id: &str) -> ServerResult<Task> {
        let record = self.load_task(task_id, &auth.task_access())?;
        record.ok_or(ServerError::TaskNotFound).and_then(record_to_task)
    }

    /// Handle `tasks/cancel`: terminate the worker serving the task
    /// (live session or orphan PID) and mark the task canceled.
    pub async fn cancel_task(&self, auth: &AuthContext, task_id: &str) -> ServerResult<Task> {
        let access = auth.task_access();
        let Some(record) = self.load_task(task_id, &access)? else {
            return Err(ServerError::TaskNotFound);
        };

        let state: TaskState = record
            .status_state
            .parse()
            .map_err(|_| ServerError::Internal("invalid stored task state".to_string()))?;
        if !state.is_cancelable() {
            return Err(ServerError::TaskNotCancelable);
        }

        let signalled = self.pool.cancel_by_task_id(task_id, self.registry.as_ref()).await;
        info!(task_id, signalled, "task cancel requested");
        let _ = self.registry.set_process_alive(&record.context_id, false);

        let mut task = record_to_task(record)?;
        task.status = TaskStatus::new(TaskState::Canceled);
        self.save_task(&task, &access)?;
        Ok(task)
    }

    fn resolve_agent(&self, message: &Message) -> Result<&AgentDefinition, Box<Message>> {
        let requested = message
            .metadata
            .as_ref()
            .and_then(|m| m.get("agent"))
            .and_then(|v| v.as_str());

        let reply = |text: String, error_type: &str| {
            Box::new(protocol_reply(message.context_id.clone(), text, error_type))
        };

        match requested {
            Some(name) => match self.config.agent(name) {
                None => Err(reply(
                    format!("Unknown agent '{name}'. See the agent card for available agents."),
                    "agent_not_found",
                )),
                Some(agent) if !agent.enabled => {
                    Err(reply(format!("Agent '{name}' is disabled."), "agent_disabled"))
                }
                Some(agent) => Ok(agent),
            },
            None => self.config.default_agent().ok_or_else(|| {
                reply("No agents are enabled on this server.".to_string(), "agent_not_found")
            }),
        }
    }

    fn launch_spec(&self, agent: &AgentDefinition, resume: Option<String>) -> WorkerLaunchSpec {
        let working_dir =
            agent.working_dir.clone().unwrap_or_else(|| self.config.workdir());
        let mut spec = WorkerLaunchSpec::new(&self.config.worker_binary, working_dir);
        spec.model = agent.model.clone();
        spec.settings_file = agent.settings_file.clone();
        spec.permission_mode = agent.permission_mode.clone();
        spec.allowed_tools = agent.allowed_tools.clone();
        spec.max_cost_usd = agent.max_cost_usd;
        spec.system_prompt_suffix = agent.system_prompt_suffix.clone();
        spec.resume_session_id = resume;
        spec.max_buffer_bytes = self.config.max_buffer_bytes;
        spec.kill_grace = self.config.kill_grace;
        spec
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_session_metadata(
        &self,
        auth: &AuthContext,
        agent: &AgentDefinition,
        context_id: &str,
        task_id: &str,
        existing: Option<SessionRecord>,
        reply: &ar_worker::WorkerReply,
        pid: Option<i64>,
    ) -> ServerResult<()> {
        match existing {
            Some(record) if record.session_id == reply.session_id => {
                self.registry.record_usage(&record.session_id, reply.total_cost_usd, pid)?;
            }
            other => {
                // Either a brand new context or a resumed context whose
                // worker minted a fresh session id; re-key the row.
                if let Some(old) = other {
                    self.registry.delete(&old.session_id)?;
                }
                let now = chrono::Utc::now().timestamp_millis();
                let evicted = self.registry.create(SessionRecord {
                    session_id: reply.session_id.clone(),
                    agent_name: agent.name.clone(),
                    client_name: Some(auth.client_name.clone()),
                    context_id: context_id.to_string(),
                    task_id: Some(task_id.to_string()),
                    created_at: now,
                    last_accessed_at: now,
                    total_cost_usd: reply.total_cost_usd,
                    message_count: 1,
                    process_alive: true,
                    last_pid: pid,
                })?;
                for victim in evicted {
                    let pool = Arc::clone(&self.pool);
                    let context_id = victim.context_id.clone();
                    tokio::spawn(async move {
                        pool.destroy_session(&context_id).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Map a worker failure to user-visible text; stderr goes to the
    /// log, truncated, never to the caller.
    fn describe_worker_error(&self, err: &WorkerError, context_id: &str) -> (String, &'static str) {
        let stderr_tail = self
            .pool
            .get(context_id)
            .map(|s| s.stderr_tail(STDERR_LOG_BYTES))
            .unwrap_or_default();

        match err {
            WorkerError::Capacity(max) => (
                format!(
                    "The server is at capacity ({max} concurrent sessions). Try again shortly."
                ),
                "capacity",
            ),
            WorkerError::SessionBusy => (
                "This session is processing another message, please wait for it to finish."
                    .to_string(),
                "session_busy",
            ),
            WorkerError::Timeout(secs) => (
                format!(
                    "The worker timed out after {secs}s. The session is still alive; \
                     send the message again to continue."
                ),
                "timeout",
            ),
            WorkerError::BufferOverflow(_) => (
                "The worker produced an oversized output line and the session was destroyed. \
                 The next message will start a fresh session."
                    .to_string(),
                "buffer_overflow",
            ),
            WorkerError::SessionDead
            | WorkerError::SessionReleased
            | WorkerError::ProcessExited => (
                "The worker session ended unexpectedly. The next message will start a fresh \
                 session."
                    .to_string(),
                "session_dead",
            ),
            WorkerError::SpawnFailed(e) => {
                error!(context_id, error = %e, "worker spawn failed");
                ("The worker failed to start.".to_string(), "worker_spawn_failed")
            }
            WorkerError::Io(e) => {
                error!(context_id, error = %e, stderr = %stderr_tail, "worker io failure");
                ("The worker failed.".to_string(), "worker_failed")
            }
            WorkerError::Json(e) => {
                error!(context_id, error = %e, "failed to encode worker payload");
                ("The worker failed.".to_string(), "worker_failed")
            }
        }
    }

    fn save_task(&self, task: &Task, access: &TaskAccess) -> ServerResult<()> {
        let record = task_to_record(task)?;
        let conn = self.db.lock()?;
        TaskStore::new(&conn).save(&record, access)?;
        Ok(())
    }

    fn load_task(&self, task_id: &str, access: &TaskAccess) -> ServerResult<Option<TaskRecord>> {
        let conn = self.db.lock()?;
        Ok(TaskStore::new(&conn).load(task_id, access)?)
    }
}

/// Build a protocol-level reply that no worker produced.
fn protocol_reply(context_id: Option<String>, text: impl Into<String>, error_type: &str) -> Message {
    Message::agent_text(text, context_id).with_metadata("error_type", json!(error_type))
}

/// Convert incoming A2A parts into worker content. Total and lossless:
/// URI-only files become an explanatory text block rather than being
/// dropped.
pub fn convert_parts(parts: &[Part]) -> WorkerContent {
    let all_text = parts.iter().all(|part| matches!(part, Part::Text { .. }));
    if all_text {
        let joined = parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        return WorkerContent::Text(joined);
    }

    let blocks = parts
        .iter()
        .map(|part| match part {
            Part::Text { text } => ContentBlock::text(text.clone()),
            Part::Data { data } => {
                let pretty = serde_json::to_string_pretty(data)
                    .unwrap_or_else(|_| data.to_string());
                ContentBlock::text(format!("Structured data:\n{pretty}"))
            }
            Part::File { file } => {
                if let Some(bytes) = &file.bytes {
                    let mime = file
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string());
                    if IMAGE_MIMES.contains(&mime.as_str()) {
                        ContentBlock::image(mime, bytes.clone())
                    } else {
                        ContentBlock::document(mime, bytes.clone())
                    }
                } else if let Some(uri) = &file.uri {
                    let name = file.name.as_deref().unwrap_or("file");
                    ContentBlock::text(format!(
                        "[The file '{name}' was referenced by URI ({uri}) but was not \
                         fetched; this server does not retrieve remote content. Send the \
                         file as base64 bytes instead.]"
                    ))
                } else {
                    ContentBlock::text("[An empty file part was provided.]".to_string())
                }
            }
        })
        .collect();
    WorkerContent::Blocks(blocks)
}

/// Serialize a wire task into its durable row.
pub fn task_to_record(task: &Task) -> ServerResult<TaskRecord> {
    Ok(TaskRecord {
        id: task.id.clone(),
        context_id: task.context_id.clone(),
        status_state: task.status.state.as_str().to_string(),
        status_timestamp: task.status.timestamp.clone(),
        status_message_json: task
            .status
            .message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ServerError::Internal(e.to_string()))?,
        artifacts_json: task
            .artifacts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ServerError::Internal(e.to_string()))?,
        history_json: task
            .history
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ServerError::Internal(e.to_string()))?,
        metadata_json: task
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ServerError::Internal(e.to_string()))?,
        client_name: None,
        updated_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Rehydrate a wire task from its durable row.
pub fn record_to_task(record: TaskRecord) -> ServerResult<Task> {
    let state: TaskState = record
        .status_state
        .parse()
        .map_err(ServerError::Internal)?;

    Ok(Task {
        id: record.id,
        context_id: record.context_id,
        status: TaskStatus {
            state,
            message: record
                .status_message_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| ServerError::Internal(e.to_string()))?,
            timestamp: record.status_timestamp,
        },
        artifacts: record
            .artifacts_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| ServerError::Internal(e.to_string()))?,
        history: record
            .history_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| ServerError::Internal(e.to_string()))?,
        metadata: record
            .metadata_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| ServerError::Internal(e.to_string()))?,
    })
}
