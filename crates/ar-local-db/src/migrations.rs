// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Forward-only schema migrations, each applied in its own transaction.

use crate::error::{DbError, DbResult};
use rusqlite::Connection;
use tracing::info;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial schema",
    sql: r#"
CREATE TABLE budget_records (
    date        TEXT NOT NULL,
    client_name TEXT NOT NULL,
    spent_usd   REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (date, client_name)
);

CREATE TABLE revoked_tokens (
    jti        TEXT PRIMARY KEY,
    revoked_at TEXT NOT NULL
);

CREATE TABLE sessions (
    session_id       TEXT PRIMARY KEY,
    agent_name       TEXT NOT NULL,
    client_name      TEXT,
    context_id       TEXT NOT NULL UNIQUE,
    task_id          TEXT UNIQUE,
    created_at       INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    total_cost_usd   REAL NOT NULL DEFAULT 0,
    message_count    INTEGER NOT NULL DEFAULT 0,
    process_alive    INTEGER NOT NULL DEFAULT 0,
    last_pid         INTEGER
);
CREATE INDEX idx_sessions_client_name ON sessions (client_name);

CREATE TABLE tasks (
    id                  TEXT PRIMARY KEY,
    context_id          TEXT NOT NULL,
    status_state        TEXT NOT NULL,
    status_timestamp    TEXT,
    status_message_json TEXT,
    artifacts_json      TEXT,
    history_json        TEXT,
    metadata_json       TEXT,
    client_name         TEXT,
    updated_at          TEXT NOT NULL
);
CREATE INDEX idx_tasks_context_id ON tasks (context_id);
"#,
}];

/// Apply every migration newer than the recorded version. Each batch
/// runs inside one transaction; a failing batch rolls back and aborts
/// the open.
pub(crate) fn apply_all(conn: &mut Connection) -> DbResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )?;

    let current = current_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql).map_err(|e| DbError::Migration {
            version: migration.version,
            message: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        info!(version = migration.version, name = migration.name, "applied migration");
    }

    Ok(())
}

/// Highest applied migration version, 0 for a fresh database.
pub(crate) fn current_version(conn: &Connection) -> DbResult<i64> {
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

/// Version a fully migrated database reports.
pub(crate) fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_increasing() {
        let mut prev = 0;
        for m in MIGRATIONS {
            assert!(m.version > prev, "migration versions must increase");
            prev = m.version;
        }
    }

    #[test]
    fn fresh_connection_migrates_to_latest() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_all(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        // Re-running is a no-op.
        apply_all(&mut conn).unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0)).unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn failing_migration_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
        )
        .unwrap();

        let bad = Migration { version: 99, name: "bad", sql: "CREATE TABLE t (x); NOT SQL;" };
        let tx = conn.transaction().unwrap();
        let result = tx.execute_batch(bad.sql);
        assert!(result.is_err());
        drop(tx); // rollback

        // The partial table must not exist.
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='t'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(exists, 0);
    }
}
