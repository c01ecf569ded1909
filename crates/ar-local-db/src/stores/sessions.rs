// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Durable worker-session metadata.

use crate::error::DbResult;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// One worker session. `session_id` is assigned by the worker on its
/// init frame; `context_id` binds the session to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub agent_name: String,
    pub client_name: Option<String>,
    pub context_id: String,
    pub task_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub total_cost_usd: f64,
    pub message_count: i64,
    /// Always false after a restart until the process is reconfirmed.
    #[serde(default)]
    pub process_alive: bool,
    pub last_pid: Option<i64>,
}

/// Session table access.
pub struct SessionStore<'a> {
    conn: &'a Connection,
}

impl<'a> SessionStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, record: &SessionRecord) -> DbResult<()> {
        self.conn.execute(
            "INSERT INTO sessions (
                session_id, agent_name, client_name, context_id, task_id,
                created_at, last_accessed_at, total_cost_usd, message_count,
                process_alive, last_pid
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.session_id,
                record.agent_name,
                record.client_name,
                record.context_id,
                record.task_id,
                record.created_at,
                record.last_accessed_at,
                record.total_cost_usd,
                record.message_count,
                record.process_alive,
                record.last_pid,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> DbResult<Option<SessionRecord>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM sessions WHERE session_id = ?1", params![session_id], map_row)
            .optional()?)
    }

    pub fn get_by_context_id(&self, context_id: &str) -> DbResult<Option<SessionRecord>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM sessions WHERE context_id = ?1", params![context_id], map_row)
            .optional()?)
    }

    pub fn get_by_task_id(&self, task_id: &str) -> DbResult<Option<SessionRecord>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM sessions WHERE task_id = ?1", params![task_id], map_row)
            .optional()?)
    }

    pub fn list_all(&self) -> DbResult<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare("SELECT * FROM sessions ORDER BY created_at")?;
        let rows = stmt.query_map([], map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_for_client(&self, client_name: &str) -> DbResult<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM sessions WHERE client_name = ?1 ORDER BY last_accessed_at",
        )?;
        let rows = stmt.query_map(params![client_name], map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete(&self, session_id: &str) -> DbResult<bool> {
        let n =
            self.conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])?;
        Ok(n > 0)
    }

    /// Accrue cost and bump the message counter after a successful
    /// invocation.
    pub fn record_usage(
        &self,
        session_id: &str,
        cost_usd: f64,
        accessed_at: i64,
    ) -> DbResult<()> {
        self.conn.execute(
            "UPDATE sessions SET
                total_cost_usd = total_cost_usd + ?2,
                message_count = message_count + 1,
                last_accessed_at = ?3
             WHERE session_id = ?1",
            params![session_id, cost_usd, accessed_at],
        )?;
        Ok(())
    }

    pub fn touch(&self, session_id: &str, accessed_at: i64) -> DbResult<()> {
        self.conn.execute(
            "UPDATE sessions SET last_accessed_at = ?2 WHERE session_id = ?1",
            params![session_id, accessed_at],
        )?;
        Ok(())
    }

    /// Record the worker PID for a context and mark the process alive.
    pub fn save_pid(&self, context_id: &str, pid: i64) -> DbResult<()> {
        self.conn.execute(
            "UPDATE sessions SET last_pid = ?2, process_alive = 1 WHERE context_id = ?1",
            params![context_id, pid],
        )?;
        Ok(())
    }

    /// PID reads go to the durable row so orphan detection works even
    /// after the in-memory index has been cleared.
    pub fn get_last_pid(&self, context_id: &str) -> DbResult<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT last_pid FROM sessions WHERE context_id = ?1",
                params![context_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    pub fn set_process_alive(&self, context_id: &str, alive: bool) -> DbResult<()> {
        self.conn.execute(
            "UPDATE sessions SET process_alive = ?2 WHERE context_id = ?1",
            params![context_id, alive],
        )?;
        Ok(())
    }

    /// Processes never survive a restart.
    pub fn mark_all_processes_dead(&self) -> DbResult<usize> {
        Ok(self.conn.execute("UPDATE sessions SET process_alive = 0", [])?)
    }

    pub fn count(&self) -> DbResult<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        session_id: row.get("session_id")?,
        agent_name: row.get("agent_name")?,
        client_name: row.get("client_name")?,
        context_id: row.get("context_id")?,
        task_id: row.get("task_id")?,
        created_at: row.get("created_at")?,
        last_accessed_at: row.get("last_accessed_at")?,
        total_cost_usd: row.get("total_cost_usd")?,
        message_count: row.get("message_count")?,
        process_alive: row.get("process_alive")?,
        last_pid: row.get("last_pid")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(session_id: &str, context_id: &str) -> SessionRecord {
        SessionRecord {
            session_id: session_id.into(),
            agent_name: "general".into(),
            client_name: Some("alice".into()),
            context_id: context_id.into(),
            task_id: Some(format!("task-{context_id}")),
            created_at: 1_000,
            last_accessed_at: 1_000,
            total_cost_usd: 0.0,
            message_count: 0,
            process_alive: true,
            last_pid: Some(4242),
        }
    }

    #[test]
    fn context_id_is_unique() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = SessionStore::new(&conn);

        store.insert(&record("s1", "ctx-1")).unwrap();
        let dup = store.insert(&record("s2", "ctx-1"));
        assert!(dup.is_err());
    }

    #[test]
    fn lookups_by_all_keys() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = SessionStore::new(&conn);

        store.insert(&record("s1", "ctx-1")).unwrap();

        assert!(store.get("s1").unwrap().is_some());
        assert!(store.get_by_context_id("ctx-1").unwrap().is_some());
        assert!(store.get_by_task_id("task-ctx-1").unwrap().is_some());
        assert_eq!(store.list_for_client("alice").unwrap().len(), 1);
        assert!(store.list_for_client("bob").unwrap().is_empty());
    }

    #[test]
    fn record_usage_accumulates() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = SessionStore::new(&conn);

        store.insert(&record("s1", "ctx-1")).unwrap();
        store.record_usage("s1", 0.25, 2_000).unwrap();
        store.record_usage("s1", 0.50, 3_000).unwrap();

        let loaded = store.get("s1").unwrap().unwrap();
        assert!((loaded.total_cost_usd - 0.75).abs() < 1e-9);
        assert_eq!(loaded.message_count, 2);
        assert_eq!(loaded.last_accessed_at, 3_000);
    }

    #[test]
    fn pid_survives_mark_all_dead() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = SessionStore::new(&conn);

        store.insert(&record("s1", "ctx-1")).unwrap();
        store.save_pid("ctx-1", 777).unwrap();
        store.mark_all_processes_dead().unwrap();

        let loaded = store.get("s1").unwrap().unwrap();
        assert!(!loaded.process_alive);
        assert_eq!(store.get_last_pid("ctx-1").unwrap(), Some(777));
    }

    #[test]
    fn delete_returns_whether_row_existed() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = SessionStore::new(&conn);

        store.insert(&record("s1", "ctx-1")).unwrap();
        assert!(store.delete("s1").unwrap());
        assert!(!store.delete("s1").unwrap());
    }
}
