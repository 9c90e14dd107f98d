use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::core::{AuthorizedScript, GuardError};
use crate::db::{ScriptFilter, SharedDatabase};
use crate::sri;

struct CacheEntry {
    /// `None` caches a confirmed "no record" answer.
    script: Option<AuthorizedScript>,
    cached_at: Instant,
}

/// Typed query surface over authorized-script records. Lookups by
/// (url, store) are cached with a TTL; every write invalidates the whole
/// cache namespace.
pub struct AuthorizedScripts {
    db: SharedDatabase,
    cache: Mutex<HashMap<(String, i64), CacheEntry>>,
    ttl: Duration,
}

impl AuthorizedScripts {
    pub fn new(db: SharedDatabase, ttl: Duration) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Whether a script is authorized for a store. True only when a record
    /// exists AND is active; a present-but-inactive record is an
    /// authoritative "not authorized", distinct from "no record".
    pub fn is_authorized(
        &self,
        script_url: &str,
        store_id: i64,
    ) -> Result<(bool, Option<AuthorizedScript>), GuardError> {
        if script_url.is_empty() {
            return Ok((false, None));
        }

        let key = (script_url.to_string(), store_id);
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.cached_at.elapsed() < self.ttl {
                    let script = entry.script.clone();
                    let authorized = script.as_ref().is_some_and(|s| s.is_active);
                    return Ok((authorized, script));
                }
            }
        }

        let script = self.db.find_authorized_by_url(script_url, store_id)?;
        let authorized = script.as_ref().is_some_and(|s| s.is_active);
        self.cache.lock().unwrap().insert(
            key,
            CacheEntry {
                script: script.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok((authorized, script))
    }

    pub fn find_by_url(
        &self,
        script_url: &str,
        store_id: i64,
    ) -> Result<Option<AuthorizedScript>, GuardError> {
        Ok(self.db.find_authorized_by_url(script_url, store_id)?)
    }

    pub fn get(&self, id: i64) -> Result<Option<AuthorizedScript>, GuardError> {
        Ok(self.db.get_authorized_script(id)?)
    }

    /// Insert after boundary validation. The derived domain is filled in when
    /// the caller left it empty.
    pub fn insert(&self, script: &mut AuthorizedScript) -> Result<i64, GuardError> {
        if script.domain.is_empty() {
            script.domain = sri::domain_of(&script.script_url);
        }
        script.validate()?;
        let id = self.db.insert_authorized_script(script)?;
        script.id = id;
        self.invalidate();
        Ok(id)
    }

    pub fn update(&self, script: &AuthorizedScript) -> Result<(), GuardError> {
        script.validate()?;
        self.db.update_authorized_script(script)?;
        self.invalidate();
        Ok(())
    }

    pub fn delete(&self, id: i64) -> Result<(), GuardError> {
        self.db.delete_authorized_script(id)?;
        self.invalidate();
        Ok(())
    }

    /// Adopt a new stored digest and mark the script verified now.
    pub fn adopt_digest(&self, id: i64, digest: &str) -> Result<(), GuardError> {
        self.db.set_script_hash(id, digest, Utc::now())?;
        self.invalidate();
        Ok(())
    }

    /// Bump the verification timestamp after a successful digest match.
    pub fn mark_verified(&self, id: i64) -> Result<(), GuardError> {
        self.db.touch_last_verified(id, Utc::now())?;
        self.invalidate();
        Ok(())
    }

    pub fn list(&self, filter: &ScriptFilter) -> Result<Vec<AuthorizedScript>, GuardError> {
        Ok(self.db.list_authorized_scripts(filter)?)
    }

    /// Active scripts whose last verification is older than `days`.
    pub fn expired_since(
        &self,
        days: u64,
        store_id: i64,
    ) -> Result<Vec<AuthorizedScript>, GuardError> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        Ok(self.db.expired_scripts(cutoff, store_id)?)
    }

    pub fn expired_before(
        &self,
        cutoff: DateTime<Utc>,
        store_id: i64,
    ) -> Result<Vec<AuthorizedScript>, GuardError> {
        Ok(self.db.expired_scripts(cutoff, store_id)?)
    }

    /// Drop every cached entry. Any write clears the whole namespace.
    pub fn invalidate(&self) {
        self.cache.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn cached_entry_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}
