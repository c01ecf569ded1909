// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Daily budget enforcement over the spend ledger.

use ar_local_db::{BudgetStore, Database, DbResult};
use serde::Serialize;
use std::sync::Arc;

/// Why a request was denied on budget grounds.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDenial {
    Global { spent: f64, cap: f64 },
    Client { client: String, spent: f64, cap: f64 },
}

impl std::fmt::Display for BudgetDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetDenial::Global { spent, cap } => write!(
                f,
                "Daily budget exhausted for this server: ${spent:.2} of ${cap:.2} spent. \
                 Try again tomorrow."
            ),
            BudgetDenial::Client { client, spent, cap } => write!(
                f,
                "Daily budget exhausted for '{client}': ${spent:.2} of ${cap:.2} spent. \
                 Try again tomorrow."
            ),
        }
    }
}

impl BudgetDenial {
    pub fn error_type(&self) -> &'static str {
        match self {
            BudgetDenial::Global { .. } => "budget_exhausted_global",
            BudgetDenial::Client { .. } => "budget_exhausted_client",
        }
    }
}

/// Budget snapshot for health and stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub date: String,
    pub global_spent_usd: f64,
    pub global_limit_usd: f64,
    pub default_client_limit_usd: f64,
    pub clients: Vec<ClientSpend>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSpend {
    pub client_name: String,
    pub spent_usd: f64,
}

/// Enforces daily caps and accrues spend.
pub struct BudgetTracker {
    db: Arc<Database>,
    global_cap: f64,
    default_client_cap: f64,
}

impl BudgetTracker {
    pub fn new(db: Arc<Database>, global_cap: f64, default_client_cap: f64) -> Self {
        Self { db, global_cap, default_client_cap }
    }

    /// UTC calendar date used as the ledger key.
    pub fn today() -> String {
        chrono::Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Pre-flight check. The per-client cap is the token override when
    /// present, otherwise the server default; the global cap always
    /// applies.
    pub fn check(&self, client_name: &str, cap_override: Option<f64>) -> DbResult<Option<BudgetDenial>> {
        let today = Self::today();
        let conn = self.db.lock()?;
        let store = BudgetStore::new(&conn);

        let global_spent = store.global_spent(&today)?;
        if global_spent >= self.global_cap {
            return Ok(Some(BudgetDenial::Global { spent: global_spent, cap: self.global_cap }));
        }

        let client_cap = cap_override.unwrap_or(self.default_client_cap);
        let client_spent = store.client_spent(&today, client_name)?;
        if client_spent >= client_cap {
            return Ok(Some(BudgetDenial::Client {
                client: client_name.to_string(),
                spent: client_spent,
                cap: client_cap,
            }));
        }

        Ok(None)
    }

    /// Synchronous write-through; no debounce.
    pub fn record_cost(&self, client_name: &str, usd: f64) -> DbResult<()> {
        if usd <= 0.0 {
            return Ok(());
        }
        let conn = self.db.lock()?;
        BudgetStore::new(&conn).record_cost(&Self::today(), client_name, usd)
    }

    pub fn snapshot(&self) -> DbResult<BudgetSnapshot> {
        let today = Self::today();
        let conn = self.db.lock()?;
        let store = BudgetStore::new(&conn);
        Ok(BudgetSnapshot {
            global_spent_usd: store.global_spent(&today)?,
            global_limit_usd: self.global_cap,
            default_client_limit_usd: self.default_client_cap,
            clients: store
                .day_snapshot(&today)?
                .into_iter()
                .map(|(client_name, spent_usd)| ClientSpend { client_name, spent_usd })
                .collect(),
            date: today,
        })
    }
}
