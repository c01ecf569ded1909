// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Durable token revocation set.

use crate::error::DbResult;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// One revoked token id. Revocation is permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedTokenRecord {
    pub jti: String,
    pub revoked_at: String,
}

/// Revoked-token table access.
pub struct RevokedTokenStore<'a> {
    conn: &'a Connection,
}

impl<'a> RevokedTokenStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Idempotent insert.
    pub fn revoke(&self, jti: &str, revoked_at: &str) -> DbResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO revoked_tokens (jti, revoked_at) VALUES (?1, ?2)",
            params![jti, revoked_at],
        )?;
        Ok(())
    }

    pub fn is_revoked(&self, jti: &str) -> DbResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM revoked_tokens WHERE jti = ?1",
            params![jti],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list(&self) -> DbResult<Vec<RevokedTokenRecord>> {
        let mut stmt =
            self.conn.prepare("SELECT jti, revoked_at FROM revoked_tokens ORDER BY revoked_at")?;
        let rows = stmt.query_map([], |row| {
            Ok(RevokedTokenRecord { jti: row.get(0)?, revoked_at: row.get(1)? })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
