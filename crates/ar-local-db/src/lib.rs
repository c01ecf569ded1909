// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Embedded SQLite state store for agent-relay.
//!
//! One database file holds every durable concern of the server: A2A
//! tasks, worker-session metadata, daily budget accrual, and revoked
//! token ids. The database is opened in WAL mode with a busy timeout
//! and migrated forward on open.
//!
//! Access pattern follows the store-per-table convention: a store
//! borrows a locked [`rusqlite::Connection`] for the duration of one
//! call.
//!
//! ```rust,ignore
//! let db = Database::open("relay.db")?;
//! let conn = db.lock()?;
//! let store = SessionStore::new(&conn);
//! let session = store.get_by_context_id("ctx-1")?;
//! ```

mod error;
mod legacy;
mod migrations;
pub mod stores;

pub use error::{DbError, DbResult};
pub use legacy::{migrate_legacy_state, LegacyMigrationReport};
pub use stores::budget::BudgetStore;
pub use stores::revoked::{RevokedTokenRecord, RevokedTokenStore};
pub use stores::sessions::{SessionRecord, SessionStore};
pub use stores::tasks::{TaskAccess, TaskRecord, TaskStore};

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Handle to the embedded database. Cheap to share via `Arc`; all
/// statements run behind one connection mutex.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (creating if necessary) the database at `path` and apply
    /// pending migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(path)?;
        Self::configure(&conn)?;
        migrations::apply_all(&mut conn)?;

        Ok(Self { conn: Mutex::new(conn), path: Some(path.to_path_buf()) })
    }

    /// Open an in-memory database. Used by tests.
    pub fn open_in_memory() -> DbResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        migrations::apply_all(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn), path: None })
    }

    fn configure(conn: &Connection) -> DbResult<()> {
        // WAL is a no-op for in-memory databases; SQLite reports the
        // active mode back, which we discard.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }

    /// Acquire the connection for a batch of statements.
    pub fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Path of the backing file, if this is not an in-memory database.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Latest applied schema version.
    pub fn schema_version(&self) -> DbResult<i64> {
        let conn = self.lock()?;
        migrations::current_version(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_reaches_latest_schema() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), migrations::latest_version());
    }

    #[test]
    fn reopen_applies_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        {
            let db = Database::open(&path).unwrap();
            assert_eq!(db.schema_version().unwrap(), migrations::latest_version());
        }
        // Second open must see the same version without error.
        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), migrations::latest_version());
    }

    #[test]
    fn wal_mode_is_active_for_file_databases() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("relay.db")).unwrap();
        let conn = db.lock().unwrap();
        let mode: String =
            conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
