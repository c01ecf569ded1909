// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! One-shot import of legacy JSON state files into the relational
//! store. Earlier releases persisted state as flat JSON dumps in the
//! data directory; on startup each file found is imported inside a
//! single transaction and renamed with a `.migrated` suffix, which
//! makes the whole pass idempotent.

use crate::stores::budget::BudgetStore;
use crate::stores::revoked::RevokedTokenStore;
use crate::stores::sessions::{SessionRecord, SessionStore};
use crate::{Database, DbResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// What the legacy import actually did, for startup logging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LegacyMigrationReport {
    pub sessions_imported: usize,
    pub budget_rows_imported: usize,
    pub tokens_imported: usize,
    pub files_migrated: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LegacySession {
    session_id: String,
    agent_name: String,
    #[serde(default)]
    client_name: Option<String>,
    context_id: String,
    #[serde(default)]
    task_id: Option<String>,
    created_at: i64,
    last_accessed_at: i64,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    message_count: i64,
    #[serde(default)]
    last_pid: Option<i64>,
}

/// Import `sessions.json`, `budget.json`, and `revoked_tokens.json`
/// from `data_dir` if present.
pub fn migrate_legacy_state(db: &Database, data_dir: &Path) -> DbResult<LegacyMigrationReport> {
    let mut report = LegacyMigrationReport::default();

    let sessions_path = data_dir.join("sessions.json");
    if sessions_path.exists() {
        let raw = std::fs::read_to_string(&sessions_path)?;
        let sessions: Vec<LegacySession> = serde_json::from_str(&raw)?;
        let mut conn = db.lock()?;
        let tx = conn.transaction()?;
        {
            let store = SessionStore::new(&tx);
            for legacy in &sessions {
                let record = SessionRecord {
                    session_id: legacy.session_id.clone(),
                    agent_name: legacy.agent_name.clone(),
                    client_name: legacy.client_name.clone(),
                    context_id: legacy.context_id.clone(),
                    task_id: legacy.task_id.clone(),
                    created_at: legacy.created_at,
                    last_accessed_at: legacy.last_accessed_at,
                    total_cost_usd: legacy.total_cost_usd,
                    message_count: legacy.message_count,
                    // No process survives the store migration.
                    process_alive: false,
                    last_pid: legacy.last_pid,
                };
                match store.insert(&record) {
                    Ok(()) => report.sessions_imported += 1,
                    Err(e) => {
                        warn!(session_id = %legacy.session_id, error = %e,
                              "skipping legacy session");
                    }
                }
            }
        }
        tx.commit()?;
        drop(conn);
        mark_migrated(&sessions_path, &mut report)?;
    }

    let budget_path = data_dir.join("budget.json");
    if budget_path.exists() {
        let raw = std::fs::read_to_string(&budget_path)?;
        let budget: HashMap<String, HashMap<String, f64>> = serde_json::from_str(&raw)?;
        let mut conn = db.lock()?;
        let tx = conn.transaction()?;
        {
            let store = BudgetStore::new(&tx);
            for (date, clients) in &budget {
                for (client, usd) in clients {
                    store.record_cost(date, client, *usd)?;
                    report.budget_rows_imported += 1;
                }
            }
        }
        tx.commit()?;
        drop(conn);
        mark_migrated(&budget_path, &mut report)?;
    }

    let tokens_path = data_dir.join("revoked_tokens.json");
    if tokens_path.exists() {
        let raw = std::fs::read_to_string(&tokens_path)?;
        let jtis: Vec<String> = serde_json::from_str(&raw)?;
        let now = chrono::Utc::now().to_rfc3339();
        let mut conn = db.lock()?;
        let tx = conn.transaction()?;
        {
            let store = RevokedTokenStore::new(&tx);
            for jti in &jtis {
                store.revoke(jti, &now)?;
                report.tokens_imported += 1;
            }
        }
        tx.commit()?;
        drop(conn);
        mark_migrated(&tokens_path, &mut report)?;
    }

    if !report.files_migrated.is_empty() {
        info!(
            sessions = report.sessions_imported,
            budget_rows = report.budget_rows_imported,
            tokens = report.tokens_imported,
            "imported legacy JSON state"
        );
    }

    Ok(report)
}

fn mark_migrated(path: &Path, report: &mut LegacyMigrationReport) -> DbResult<()> {
    let mut migrated = path.as_os_str().to_owned();
    migrated.push(".migrated");
    std::fs::rename(path, &migrated)?;
    report.files_migrated.push(path.file_name().unwrap_or_default().to_string_lossy().into_owned());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imports_all_three_files_and_renames_them() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sessions.json"),
            r#"[{"session_id":"s1","agent_name":"general","context_id":"ctx-1",
                 "created_at":1000,"last_accessed_at":2000,"total_cost_usd":0.5,
                 "message_count":3,"last_pid":99}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("budget.json"), r#"{"2026-08-01":{"alice":1.5}}"#).unwrap();
        std::fs::write(dir.path().join("revoked_tokens.json"), r#"["jti-1","jti-2"]"#).unwrap();

        let db = Database::open(dir.path().join("relay.db")).unwrap();
        let report = migrate_legacy_state(&db, dir.path()).unwrap();

        assert_eq!(report.sessions_imported, 1);
        assert_eq!(report.budget_rows_imported, 1);
        assert_eq!(report.tokens_imported, 2);
        assert_eq!(report.files_migrated.len(), 3);

        let conn = db.lock().unwrap();
        let session = SessionStore::new(&conn).get("s1").unwrap().unwrap();
        assert!(!session.process_alive);
        assert_eq!(session.last_pid, Some(99));
        assert!(RevokedTokenStore::new(&conn).is_revoked("jti-1").unwrap());
        assert!((BudgetStore::new(&conn).client_spent("2026-08-01", "alice").unwrap() - 1.5).abs()
            < 1e-9);

        assert!(dir.path().join("sessions.json.migrated").exists());
        assert!(!dir.path().join("sessions.json").exists());
    }

    #[test]
    fn second_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("revoked_tokens.json"), r#"["jti-1"]"#).unwrap();

        let db = Database::open(dir.path().join("relay.db")).unwrap();
        let first = migrate_legacy_state(&db, dir.path()).unwrap();
        assert_eq!(first.tokens_imported, 1);

        let second = migrate_legacy_state(&db, dir.path()).unwrap();
        assert_eq!(second, LegacyMigrationReport::default());
    }

    #[test]
    fn missing_files_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("relay.db")).unwrap();
        let report = migrate_legacy_state(&db, dir.path()).unwrap();
        assert_eq!(report, LegacyMigrationReport::default());
    }
}
