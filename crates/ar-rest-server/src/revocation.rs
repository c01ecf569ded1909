// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Token revocation: durable set with an in-memory read cache.

use ar_local_db::{Database, DbResult, RevokedTokenRecord, RevokedTokenStore};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Revocation set. Reads are O(1) against the cache; writes go to the
/// database first and the cache second, so a crash can only lose a
/// cache entry that the next startup re-hydrates.
pub struct RevocationCache {
    db: Arc<Database>,
    cache: RwLock<HashSet<String>>,
}

impl RevocationCache {
    /// Hydrate the cache from the durable set.
    pub fn load(db: Arc<Database>) -> DbResult<Self> {
        let jtis: HashSet<String> = {
            let conn = db.lock()?;
            RevokedTokenStore::new(&conn).list()?.into_iter().map(|r| r.jti).collect()
        };
        if !jtis.is_empty() {
            info!(count = jtis.len(), "loaded revoked tokens");
        }
        Ok(Self { db, cache: RwLock::new(jtis) })
    }

    pub fn revoke(&self, jti: &str) -> DbResult<()> {
        {
            let conn = self.db.lock()?;
            RevokedTokenStore::new(&conn).revoke(jti, &chrono::Utc::now().to_rfc3339())?;
        }
        self.cache.write().expect("revocation cache poisoned").insert(jti.to_string());
        Ok(())
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.cache.read().expect("revocation cache poisoned").contains(jti)
    }

    pub fn list(&self) -> DbResult<Vec<RevokedTokenRecord>> {
        let conn = self.db.lock()?;
        RevokedTokenStore::new(&conn).list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revocation_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        {
            let db = Arc::new(Database::open(&path).unwrap());
            let cache = RevocationCache::load(Arc::clone(&db)).unwrap();
            assert!(!cache.is_revoked("jti-1"));
            cache.revoke("jti-1").unwrap();
            assert!(cache.is_revoked("jti-1"));
        }

        let db = Arc::new(Database::open(&path).unwrap());
        let cache = RevocationCache::load(db).unwrap();
        assert!(cache.is_revoked("jti-1"));
        assert!(!cache.is_revoked("jti-2"));
    }
}
