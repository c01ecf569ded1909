// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Daily spend ledger keyed by (date, client).

use crate::error::DbResult;
use rusqlite::{params, Connection, OptionalExtension};

/// Budget table access. Rollover is implicit: a new day queries a row
/// that does not exist yet.
pub struct BudgetStore<'a> {
    conn: &'a Connection,
}

impl<'a> BudgetStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Additive upsert; every successful invocation writes through
    /// immediately.
    pub fn record_cost(&self, date: &str, client_name: &str, usd: f64) -> DbResult<()> {
        self.conn.execute(
            "INSERT INTO budget_records (date, client_name, spent_usd)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(date, client_name)
             DO UPDATE SET spent_usd = spent_usd + excluded.spent_usd",
            params![date, client_name, usd],
        )?;
        Ok(())
    }

    pub fn client_spent(&self, date: &str, client_name: &str) -> DbResult<f64> {
        Ok(self
            .conn
            .query_row(
                "SELECT spent_usd FROM budget_records WHERE date = ?1 AND client_name = ?2",
                params![date, client_name],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0.0))
    }

    pub fn global_spent(&self, date: &str) -> DbResult<f64> {
        let total: Option<f64> = self.conn.query_row(
            "SELECT SUM(spent_usd) FROM budget_records WHERE date = ?1",
            params![date],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0.0))
    }

    /// Per-client spend for one day, used by the stats endpoint.
    pub fn day_snapshot(&self, date: &str) -> DbResult<Vec<(String, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT client_name, spent_usd FROM budget_records
             WHERE date = ?1 ORDER BY spent_usd DESC",
        )?;
        let rows = stmt.query_map(params![date], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
