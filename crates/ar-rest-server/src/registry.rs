// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Session registry: authoritative durable rows plus in-memory indices
//! by session, context, task, and client.
//!
//! Writes go to the database immediately; metadata reads prefer the
//! in-memory copy; PID reads always go to the durable row so orphan
//! detection works after the in-memory index is gone.

use ar_local_db::{Database, DbResult, SessionRecord, SessionStore};
use ar_worker::SessionPidLookup;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Default)]
struct Indices {
    by_session: HashMap<String, SessionRecord>,
    context_to_session: HashMap<String, String>,
    task_to_session: HashMap<String, String>,
    by_client: HashMap<String, HashSet<String>>,
}

impl Indices {
    fn insert(&mut self, record: SessionRecord) {
        self.context_to_session.insert(record.context_id.clone(), record.session_id.clone());
        if let Some(task_id) = &record.task_id {
            self.task_to_session.insert(task_id.clone(), record.session_id.clone());
        }
        if let Some(client) = &record.client_name {
            self.by_client.entry(client.clone()).or_default().insert(record.session_id.clone());
        }
        self.by_session.insert(record.session_id.clone(), record);
    }

    fn remove(&mut self, session_id: &str) -> Option<SessionRecord> {
        let record = self.by_session.remove(session_id)?;
        self.context_to_session.remove(&record.context_id);
        if let Some(task_id) = &record.task_id {
            self.task_to_session.remove(task_id);
        }
        if let Some(client) = &record.client_name {
            if let Some(set) = self.by_client.get_mut(client) {
                set.remove(session_id);
                if set.is_empty() {
                    self.by_client.remove(client);
                }
            }
        }
        Some(record)
    }
}

/// Shared session index. All four in-memory indices update as a unit
/// under one lock.
pub struct SessionRegistry {
    db: Arc<Database>,
    indices: Mutex<Indices>,
    max_per_client: usize,
}

impl SessionRegistry {
    /// Load all rows with `process_alive := false` (processes never
    /// survive a restart) and rebuild the indices.
    pub fn load(db: Arc<Database>, max_per_client: usize) -> DbResult<Self> {
        let records = {
            let conn = db.lock()?;
            let store = SessionStore::new(&conn);
            store.mark_all_processes_dead()?;
            store.list_all()?
        };

        let mut indices = Indices::default();
        let count = records.len();
        for record in records {
            indices.insert(record);
        }
        if count > 0 {
            info!(count, "loaded persisted sessions");
        }

        Ok(Self { db, indices: Mutex::new(indices), max_per_client })
    }

    /// Register a new session. When the owning client is at its cap,
    /// the least-recently-accessed session is evicted first; evicted
    /// records are returned so the caller can destroy the underlying
    /// workers.
    pub fn create(&self, record: SessionRecord) -> DbResult<Vec<SessionRecord>> {
        let mut evicted = Vec::new();

        let mut indices = self.indices.lock().expect("registry poisoned");
        if let Some(client) = &record.client_name {
            let owned: Vec<String> =
                indices.by_client.get(client).map(|s| s.iter().cloned().collect()).unwrap_or_default();
            if owned.len() >= self.max_per_client {
                let mut candidates: Vec<SessionRecord> = owned
                    .iter()
                    .filter_map(|id| indices.by_session.get(id).cloned())
                    .collect();
                candidates.sort_by_key(|r| r.last_accessed_at);
                let surplus = owned.len() + 1 - self.max_per_client;
                for victim in candidates.into_iter().take(surplus) {
                    warn!(
                        session_id = %victim.session_id,
                        client = %client,
                        "per-client session cap reached, evicting oldest"
                    );
                    indices.remove(&victim.session_id);
                    let conn = self.db.lock()?;
                    SessionStore::new(&conn).delete(&victim.session_id)?;
                    evicted.push(victim);
                }
            }
        }

        {
            let conn = self.db.lock()?;
            SessionStore::new(&conn).insert(&record)?;
        }
        indices.insert(record);
        Ok(evicted)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        let mut indices = self.indices.lock().expect("registry poisoned");
        self.touch_locked(&mut indices, session_id)
    }

    pub fn get_by_context_id(&self, context_id: &str) -> Option<SessionRecord> {
        let mut indices = self.indices.lock().expect("registry poisoned");
        let session_id = indices.context_to_session.get(context_id)?.clone();
        self.touch_locked(&mut indices, &session_id)
    }

    pub fn get_by_task_id(&self, task_id: &str) -> Option<SessionRecord> {
        let mut indices = self.indices.lock().expect("registry poisoned");
        let session_id = indices.task_to_session.get(task_id)?.clone();
        self.touch_locked(&mut indices, &session_id)
    }

    /// Peek without touching `last_accessed_at`.
    pub fn peek_by_context_id(&self, context_id: &str) -> Option<SessionRecord> {
        let indices = self.indices.lock().expect("registry poisoned");
        let session_id = indices.context_to_session.get(context_id)?;
        indices.by_session.get(session_id).cloned()
    }

    fn touch_locked(&self, indices: &mut Indices, session_id: &str) -> Option<SessionRecord> {
        let record = indices.by_session.get_mut(session_id)?;
        record.last_accessed_at = now_ms();
        let snapshot = record.clone();
        if let Ok(conn) = self.db.lock() {
            let _ = SessionStore::new(&conn).touch(session_id, snapshot.last_accessed_at);
        }
        Some(snapshot)
    }

    pub fn list_all(&self) -> Vec<SessionRecord> {
        let indices = self.indices.lock().expect("registry poisoned");
        let mut records: Vec<SessionRecord> = indices.by_session.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn list_for_client(&self, client_name: &str) -> Vec<SessionRecord> {
        let indices = self.indices.lock().expect("registry poisoned");
        let mut records: Vec<SessionRecord> = indices
            .by_client
            .get(client_name)
            .into_iter()
            .flatten()
            .filter_map(|id| indices.by_session.get(id).cloned())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn delete(&self, session_id: &str) -> DbResult<Option<SessionRecord>> {
        let removed = {
            let mut indices = self.indices.lock().expect("registry poisoned");
            indices.remove(session_id)
        };
        if removed.is_some() {
            let conn = self.db.lock()?;
            SessionStore::new(&conn).delete(session_id)?;
        }
        Ok(removed)
    }

    /// Accrue cost, bump the message counter, and refresh the PID
    /// after a successful invocation.
    pub fn record_usage(&self, session_id: &str, cost_usd: f64, pid: Option<i64>) -> DbResult<()> {
        let accessed_at = now_ms();
        let context_id = {
            let mut indices = self.indices.lock().expect("registry poisoned");
            let Some(record) = indices.by_session.get_mut(session_id) else {
                return Ok(());
            };
            record.total_cost_usd += cost_usd;
            record.message_count += 1;
            record.last_accessed_at = accessed_at;
            if pid.is_some() {
                record.last_pid = pid;
                record.process_alive = true;
            }
            record.context_id.clone()
        };

        let conn = self.db.lock()?;
        let store = SessionStore::new(&conn);
        store.record_usage(session_id, cost_usd, accessed_at)?;
        if let Some(pid) = pid {
            store.save_pid(&context_id, pid)?;
        }
        Ok(())
    }

    pub fn save_pid(&self, context_id: &str, pid: i64) -> DbResult<()> {
        {
            let mut indices = self.indices.lock().expect("registry poisoned");
            if let Some(session_id) = indices.context_to_session.get(context_id).cloned() {
                if let Some(record) = indices.by_session.get_mut(&session_id) {
                    record.last_pid = Some(pid);
                    record.process_alive = true;
                }
            }
        }
        let conn = self.db.lock()?;
        SessionStore::new(&conn).save_pid(context_id, pid)
    }

    pub fn set_process_alive(&self, context_id: &str, alive: bool) -> DbResult<()> {
        {
            let mut indices = self.indices.lock().expect("registry poisoned");
            if let Some(session_id) = indices.context_to_session.get(context_id).cloned() {
                if let Some(record) = indices.by_session.get_mut(&session_id) {
                    record.process_alive = alive;
                }
            }
        }
        let conn = self.db.lock()?;
        SessionStore::new(&conn).set_process_alive(context_id, alive)
    }

    /// Shutdown bookkeeping: no process survives the server.
    pub fn mark_all_dead(&self) -> DbResult<()> {
        {
            let mut indices = self.indices.lock().expect("registry poisoned");
            for record in indices.by_session.values_mut() {
                record.process_alive = false;
            }
        }
        let conn = self.db.lock()?;
        SessionStore::new(&conn).mark_all_processes_dead()?;
        Ok(())
    }

    /// Remove sessions past their idle or lifetime budget. Returns the
    /// removed records so the caller can destroy the workers.
    pub fn sweep(&self, max_idle: Duration, max_lifetime: Duration) -> DbResult<Vec<SessionRecord>> {
        let now = now_ms();
        let max_idle_ms = max_idle.as_millis() as i64;
        let max_lifetime_ms = max_lifetime.as_millis() as i64;

        let victims: Vec<SessionRecord> = {
            let indices = self.indices.lock().expect("registry poisoned");
            indices
                .by_session
                .values()
                .filter(|r| {
                    now - r.created_at > max_lifetime_ms || now - r.last_accessed_at > max_idle_ms
                })
                .cloned()
                .collect()
        };

        for victim in &victims {
            info!(session_id = %victim.session_id, context_id = %victim.context_id,
                  "sweeping expired session");
            self.delete(&victim.session_id)?;
        }
        Ok(victims)
    }

    pub fn count(&self) -> usize {
        self.indices.lock().expect("registry poisoned").by_session.len()
    }

    /// Durable PID read; works even when the in-memory row is gone.
    pub fn last_pid_durable(&self, context_id: &str) -> Option<i64> {
        let conn = self.db.lock().ok()?;
        SessionStore::new(&conn).get_last_pid(context_id).ok()?
    }
}

impl SessionPidLookup for SessionRegistry {
    fn context_for_task(&self, task_id: &str) -> Option<String> {
        let indices = self.indices.lock().expect("registry poisoned");
        let session_id = indices.task_to_session.get(task_id)?;
        indices.by_session.get(session_id).map(|r| r.context_id.clone())
    }

    fn last_pid(&self, context_id: &str) -> Option<i64> {
        self.last_pid_durable(context_id)
    }
}
