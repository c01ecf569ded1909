// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! The context→session multiplexer.
//!
//! The pool exclusively owns every live [`WorkerSession`]. Contexts are
//! bound to sessions for their lifetime; dead sessions are forgotten
//! and re-created on the next message. Cancellation reaches live
//! sessions directly and orphaned workers from a previous server run
//! through their recorded PID.

use crate::error::{WorkerError, WorkerResult};
use crate::process;
use crate::session::{DeathCallback, WorkerLaunchSpec, WorkerReply, WorkerSession};
use crate::content::WorkerContent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pool-level configuration snapshot.
#[derive(Debug, Clone)]
pub struct SessionPoolOptions {
    /// Maximum live sessions; a busy session still counts.
    pub max_concurrent: usize,
    /// Per-message reply timeout.
    pub request_timeout: Duration,
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        Self { max_concurrent: 10, request_timeout: Duration::from_secs(300) }
    }
}

/// Durable-state lookups the pool needs for orphan cancellation.
/// Implemented by the server's session registry.
pub trait SessionPidLookup: Send + Sync {
    /// Context a task was bound to, if known.
    fn context_for_task(&self, task_id: &str) -> Option<String>;
    /// Last recorded worker PID for a context.
    fn last_pid(&self, context_id: &str) -> Option<i64>;
}

/// Result of one pool dispatch.
#[derive(Debug)]
pub struct PoolReply {
    pub reply: WorkerReply,
    /// PID of the worker that served the message.
    pub pid: Option<u32>,
    /// Whether this dispatch spawned a fresh worker.
    pub created: bool,
}

#[derive(Default)]
struct PoolInner {
    by_context: HashMap<String, Arc<WorkerSession>>,
    task_to_context: HashMap<String, String>,
}

/// Owner of all live worker sessions.
pub struct SessionPool {
    inner: Arc<Mutex<PoolInner>>,
    options: SessionPoolOptions,
}

impl SessionPool {
    pub fn new(options: SessionPoolOptions) -> Self {
        Self { inner: Arc::new(Mutex::new(PoolInner::default())), options }
    }

    /// Dispatch one message, spawning or reusing the context's session.
    pub async fn send_message(
        &self,
        agent_name: &str,
        spec: &WorkerLaunchSpec,
        content: &WorkerContent,
        context_id: &str,
        task_id: Option<&str>,
    ) -> WorkerResult<PoolReply> {
        let (session, created) = {
            let mut inner = self.inner.lock().unwrap();

            // Forget a session whose process has died.
            if let Some(existing) = inner.by_context.get(context_id) {
                if !existing.is_alive() {
                    debug!(context_id, "forgetting dead session");
                    inner.by_context.remove(context_id);
                }
            }

            match inner.by_context.get(context_id) {
                Some(existing) => {
                    let existing = Arc::clone(existing);
                    if let Some(task_id) = task_id {
                        inner.task_to_context.insert(task_id.to_string(), context_id.to_string());
                    }
                    (existing, false)
                }
                None => {
                    if inner.by_context.len() >= self.options.max_concurrent {
                        return Err(WorkerError::Capacity(self.options.max_concurrent));
                    }

                    let weak: Weak<Mutex<PoolInner>> = Arc::downgrade(&self.inner);
                    let on_death: DeathCallback = Box::new(move |context_id: &str| {
                        if let Some(inner) = weak.upgrade() {
                            let mut inner = inner.lock().unwrap();
                            inner.by_context.remove(context_id);
                            inner.task_to_context.retain(|_, ctx| ctx != context_id);
                            debug!(context_id, "session removed from pool on death");
                        }
                    });

                    let session = WorkerSession::spawn(spec, context_id, agent_name, Some(on_death))?;
                    inner.by_context.insert(context_id.to_string(), Arc::clone(&session));
                    if let Some(task_id) = task_id {
                        inner.task_to_context.insert(task_id.to_string(), context_id.to_string());
                    }
                    info!(context_id, agent = agent_name, pid = session.pid(), "created worker session");
                    (session, true)
                }
            }
        };

        let pid = session.pid();
        let reply = session.send_message(content, self.options.request_timeout).await?;
        Ok(PoolReply { reply, pid, created })
    }

    /// Session currently bound to a context, if any.
    pub fn get(&self, context_id: &str) -> Option<Arc<WorkerSession>> {
        self.inner.lock().unwrap().by_context.get(context_id).cloned()
    }

    /// Number of live sessions (busy ones included).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Explicitly terminate the session bound to a context.
    pub async fn destroy_session(&self, context_id: &str) -> bool {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            inner.task_to_context.retain(|_, ctx| ctx != context_id);
            inner.by_context.remove(context_id)
        };
        match session {
            Some(session) => {
                session.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Destroy every session and clear all indices.
    pub async fn kill_all(&self) {
        let sessions: Vec<Arc<WorkerSession>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.task_to_context.clear();
            inner.by_context.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.destroy().await;
        }
    }

    /// Cancel the worker serving a task. Reaches live sessions first
    /// and falls back to the recorded PID, which also covers orphans
    /// from a previous server run. Returns whether anything was
    /// signalled.
    pub async fn cancel_by_task_id(&self, task_id: &str, store: &dyn SessionPidLookup) -> bool {
        let context_id = {
            let inner = self.inner.lock().unwrap();
            inner.task_to_context.get(task_id).cloned()
        };
        let context_id = context_id.or_else(|| store.context_for_task(task_id));

        let Some(context_id) = context_id else {
            return false;
        };

        if self.destroy_session(&context_id).await {
            info!(task_id, context_id = %context_id, "cancelled live session");
            return true;
        }

        if let Some(pid) = store.last_pid(&context_id) {
            if process::is_pid_alive(pid) {
                warn!(task_id, pid, "terminating orphaned worker");
                process::terminate_group_with_escalation(pid, Duration::from_secs(5));
                return true;
            }
        }
        false
    }

    /// Tasks whose session is currently alive, for the shutdown path
    /// to annotate before release.
    pub fn live_tasks(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .task_to_context
            .iter()
            .filter(|(_, ctx)| inner.by_context.get(*ctx).is_some_and(|s| s.is_alive()))
            .map(|(task, ctx)| (task.clone(), ctx.clone()))
            .collect()
    }

    /// Graceful shutdown: release every session (no kill) and clear
    /// the indices. Returns the released contexts with their PIDs so
    /// the caller can persist them for orphan detection.
    pub async fn release_all(&self) -> Vec<(String, Option<u32>)> {
        let sessions: Vec<Arc<WorkerSession>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.task_to_context.clear();
            inner.by_context.drain().map(|(_, s)| s).collect()
        };

        let mut released = Vec::with_capacity(sessions.len());
        for session in sessions {
            let context_id = session.context_id().to_string();
            let pid = session.pid();
            session.release().await;
            released.push((context_id, pid));
        }
        info!(count = released.len(), "released all sessions");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoPids;
    impl SessionPidLookup for NoPids {
        fn context_for_task(&self, _task_id: &str) -> Option<String> {
            None
        }
        fn last_pid(&self, _context_id: &str) -> Option<i64> {
            None
        }
    }

    #[tokio::test]
    async fn empty_pool_reports_zero() {
        let pool = SessionPool::new(SessionPoolOptions::default());
        assert!(pool.is_empty());
        assert!(pool.get("ctx").is_none());
        assert!(!pool.destroy_session("ctx").await);
        assert!(!pool.cancel_by_task_id("task", &NoPids).await);
    }

    #[tokio::test]
    async fn capacity_failure_does_not_spawn() {
        let pool = SessionPool::new(SessionPoolOptions {
            max_concurrent: 0,
            request_timeout: Duration::from_secs(1),
        });
        let spec = WorkerLaunchSpec::new("/nonexistent/worker", "/tmp");
        let err = pool
            .send_message("general", &spec, &WorkerContent::Text("hi".into()), "ctx", None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Capacity(0)));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_pool_empty() {
        let pool = SessionPool::new(SessionPoolOptions::default());
        let spec = WorkerLaunchSpec::new("/nonexistent/worker", "/tmp");
        let err = pool
            .send_message("general", &spec, &WorkerContent::Text("hi".into()), "ctx", Some("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::SpawnFailed(_)));
        assert!(pool.is_empty());
        assert!(pool.live_tasks().is_empty());
    }
}
