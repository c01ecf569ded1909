// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Ownership-enforcing task persistence.

use crate::error::DbResult;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Who is asking for a task. Ownership checks happen inside the store
/// so every caller gets the same policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAccess {
    /// Trusted internal path (shutdown bookkeeping, background loops);
    /// inserts carry no owner.
    Internal,
    /// Shared-secret tier: sees every task, stamps its own identity on
    /// inserts.
    Admin(String),
    /// Token tier; sees only its own tasks and legacy unowned rows.
    Client(String),
}

impl TaskAccess {
    fn owner_for_insert(&self) -> Option<&str> {
        match self {
            TaskAccess::Admin(name) | TaskAccess::Client(name) => Some(name),
            TaskAccess::Internal => None,
        }
    }
}

/// Durable task row. Complex fields are stored as JSON blobs.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub context_id: String,
    pub status_state: String,
    pub status_timestamp: Option<String>,
    pub status_message_json: Option<String>,
    pub artifacts_json: Option<String>,
    pub history_json: Option<String>,
    pub metadata_json: Option<String>,
    /// Owning client; stamped on insert, never overwritten.
    pub client_name: Option<String>,
    pub updated_at: String,
}

/// Task table access.
pub struct TaskStore<'a> {
    conn: &'a Connection,
}

impl<'a> TaskStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Upsert a task. On insert the caller's client identity becomes
    /// the immutable owner; on update `client_name` is left untouched
    /// regardless of the caller.
    pub fn save(&self, record: &TaskRecord, access: &TaskAccess) -> DbResult<()> {
        self.conn.execute(
            "INSERT INTO tasks (
                id, context_id, status_state, status_timestamp, status_message_json,
                artifacts_json, history_json, metadata_json, client_name, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                context_id = excluded.context_id,
                status_state = excluded.status_state,
                status_timestamp = excluded.status_timestamp,
                status_message_json = excluded.status_message_json,
                artifacts_json = excluded.artifacts_json,
                history_json = excluded.history_json,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at",
            params![
                record.id,
                record.context_id,
                record.status_state,
                record.status_timestamp,
                record.status_message_json,
                record.artifacts_json,
                record.history_json,
                record.metadata_json,
                access.owner_for_insert(),
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Load a task, applying the tenant policy. A denied row is
    /// indistinguishable from a missing one.
    pub fn load(&self, task_id: &str, access: &TaskAccess) -> DbResult<Option<TaskRecord>> {
        let record = self
            .conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![task_id], map_row)
            .optional()?;

        let Some(record) = record else {
            return Ok(None);
        };

        let visible = match access {
            TaskAccess::Internal | TaskAccess::Admin(_) => true,
            TaskAccess::Client(name) => match &record.client_name {
                None => true,
                Some(owner) => owner == name,
            },
        };

        Ok(visible.then_some(record))
    }

    /// Tasks whose lifecycle is still open, used by the shutdown path.
    pub fn list_in_state(&self, state: &str) -> DbResult<Vec<TaskRecord>> {
        let mut stmt = self.conn.prepare("SELECT * FROM tasks WHERE status_state = ?1")?;
        let rows = stmt.query_map(params![state], map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> DbResult<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get("id")?,
        context_id: row.get("context_id")?,
        status_state: row.get("status_state")?,
        status_timestamp: row.get("status_timestamp")?,
        status_message_json: row.get("status_message_json")?,
        artifacts_json: row.get("artifacts_json")?,
        history_json: row.get("history_json")?,
        metadata_json: row.get("metadata_json")?,
        client_name: row.get("client_name")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(id: &str) -> TaskRecord {
        TaskRecord {
            id: id.into(),
            context_id: "ctx-1".into(),
            status_state: "submitted".into(),
            status_timestamp: Some("2026-01-01T00:00:00Z".into()),
            status_message_json: None,
            artifacts_json: None,
            history_json: None,
            metadata_json: Some(r#"{"agent":"general"}"#.into()),
            client_name: None,
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn insert_stamps_owner_and_update_preserves_it() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = TaskStore::new(&conn);

        store.save(&record("t1"), &TaskAccess::Client("alice".into())).unwrap();

        // Update as a different caller; owner must stay alice.
        let mut updated = record("t1");
        updated.status_state = "completed".into();
        store.save(&updated, &TaskAccess::Client("bob".into())).unwrap();

        let loaded = store.load("t1", &TaskAccess::Admin("master".into())).unwrap().unwrap();
        assert_eq!(loaded.client_name.as_deref(), Some("alice"));
        assert_eq!(loaded.status_state, "completed");
    }

    #[test]
    fn cross_tenant_load_is_indistinguishable_from_missing() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = TaskStore::new(&conn);

        store.save(&record("t1"), &TaskAccess::Client("alice".into())).unwrap();

        assert!(store.load("t1", &TaskAccess::Client("bob".into())).unwrap().is_none());
        assert!(store.load("does-not-exist", &TaskAccess::Client("bob".into())).unwrap().is_none());
        assert!(store.load("t1", &TaskAccess::Client("alice".into())).unwrap().is_some());
        assert!(store.load("t1", &TaskAccess::Admin("master".into())).unwrap().is_some());
        assert!(store.load("t1", &TaskAccess::Internal).unwrap().is_some());
    }

    #[test]
    fn unowned_rows_are_visible_to_any_client() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = TaskStore::new(&conn);

        store.save(&record("t1"), &TaskAccess::Internal).unwrap();
        assert!(store.load("t1", &TaskAccess::Client("bob".into())).unwrap().is_some());
    }

    #[test]
    fn round_trip_preserves_json_blobs() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = TaskStore::new(&conn);

        let mut rec = record("t1");
        rec.status_message_json = Some(r#"{"messageId":"m1","role":"agent","parts":[]}"#.into());
        rec.history_json = Some("[]".into());
        store.save(&rec, &TaskAccess::Internal).unwrap();

        let loaded = store.load("t1", &TaskAccess::Internal).unwrap().unwrap();
        assert_eq!(loaded.status_message_json, rec.status_message_json);
        assert_eq!(loaded.history_json, rec.history_json);
        assert_eq!(loaded.metadata_json, rec.metadata_json);
    }

    #[test]
    fn list_in_state_filters() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let store = TaskStore::new(&conn);

        store.save(&record("t1"), &TaskAccess::Internal).unwrap();
        let mut working = record("t2");
        working.status_state = "working".into();
        store.save(&working, &TaskAccess::Internal).unwrap();

        let rows = store.list_in_state("working").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "t2");
    }
}
