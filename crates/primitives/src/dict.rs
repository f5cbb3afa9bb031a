//! DictManager: a namespaced key-value map with optional per-key TTL
//!
//! Values are arbitrary JSON; typed callers pass any `Serialize` value in
//! and ask for any `DeserializeOwned` type back. Expired entries are purged
//! lazily: the first read past `expires_at` deletes the row and reports the
//! key absent.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use beaver_concurrency::{CacheRegistry, CacheStats, LockGuard};
use beaver_core::{from_json, now, to_json, Error, Result};
use beaver_storage::Storage;

use crate::manager::ManagerCore;

/// A named dictionary stored in `beaver_dicts`.
pub struct DictManager {
    core: ManagerCore,
}

impl DictManager {
    pub(crate) const KIND: &'static str = "dict";

    /// Create the manager for `name`.
    pub fn new(name: &str, storage: Arc<Storage>, caches: Arc<CacheRegistry>) -> Result<Self> {
        Ok(DictManager {
            core: ManagerCore::new(Self::KIND, name, storage, caches)?,
        })
    }

    /// The dictionary's name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Acquire the public lock for a batch of operations.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.core.lock_guard()
    }

    /// Cache counters for this thread's view of the dictionary.
    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache().stats()
    }

    /// Set `key` to `value`, optionally expiring after `ttl` seconds.
    ///
    /// A non-positive TTL is rejected with *invalid-argument*.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<f64>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) if ttl <= 0.0 => {
                return Err(Error::InvalidArgument("ttl must be positive".into()));
            }
            Some(ttl) => Some(now() + ttl),
            None => None,
        };
        let raw = to_json(value)?;

        self.core.mutate(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO beaver_dicts (dict_name, key, value, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![self.core.name(), key, raw, expires_at],
            )?;
            Ok(())
        })
    }

    /// Get `key`, or `None` when absent or expired.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.try_get(key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::KeyNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Get `key`, failing with *key-absent* when missing or expired.
    ///
    /// TTL-bearing entries bypass the cache so an expired value can never
    /// be served from memory.
    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let cache = self.core.cache();
        let cache_key = format!("get:{key}");

        if !self.core.lock().is_acquired() {
            if let Some(raw) = cache.get(&cache_key)? {
                if let Ok(value) = serde_json::from_value::<T>(raw) {
                    return Ok(value);
                }
            }
        }

        let row: Option<(String, Option<f64>)> = self.core.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value, expires_at FROM beaver_dicts WHERE dict_name = ?1 AND key = ?2",
                    params![self.core.name(), key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;

        let missing = || Error::KeyNotFound {
            namespace: self.core.name().to_string(),
            key: key.to_string(),
        };

        let (raw, expires_at) = row.ok_or_else(missing)?;

        if let Some(expires_at) = expires_at {
            if now() > expires_at {
                // Lazy purge: delete the dead row, then report absent.
                self.core.read(|conn| {
                    conn.execute(
                        "DELETE FROM beaver_dicts WHERE dict_name = ?1 AND key = ?2",
                        params![self.core.name(), key],
                    )?;
                    Ok(())
                })?;
                cache.pop(&cache_key);
                return Err(missing());
            }
            // Never cache a value that can expire underneath us.
            return from_json(&raw);
        }

        let value: Value = from_json(&raw)?;
        cache.set(&cache_key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Remove `key`, failing with *key-absent* when missing.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.core.mutate(|tx| {
            let rows = tx.execute(
                "DELETE FROM beaver_dicts WHERE dict_name = ?1 AND key = ?2",
                params![self.core.name(), key],
            )?;
            if rows == 0 {
                return Err(Error::KeyNotFound {
                    namespace: self.core.name().to_string(),
                    key: key.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Remove and return `key`, failing with *key-absent* when missing.
    pub fn pop<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.try_get::<T>(key)?;
        self.delete(key)?;
        Ok(value)
    }

    /// Whether a live (non-expired) entry exists for `key`.
    pub fn contains(&self, key: &str) -> Result<bool> {
        match self.try_get::<Value>(key) {
            Ok(_) => Ok(true),
            Err(Error::KeyNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Number of entries, expired rows included until their lazy purge.
    pub fn len(&self) -> Result<u64> {
        self.core.cached_read(Some("len".into()), |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM beaver_dicts WHERE dict_name = ?1",
                params![self.core.name()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Whether the dictionary has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All keys.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.core.cached_read(Some("keys".into()), |conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM beaver_dicts WHERE dict_name = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![self.core.name()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }

    /// All values.
    pub fn values<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        Ok(self
            .items::<T>()?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// All `(key, value)` pairs.
    pub fn items<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>> {
        self.core.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value FROM beaver_dicts WHERE dict_name = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![self.core.name()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut items = Vec::new();
            for row in rows {
                let (key, raw) = row?;
                items.push((key, from_json(&raw)?));
            }
            Ok(items)
        })
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        self.core.mutate(|tx| {
            tx.execute(
                "DELETE FROM beaver_dicts WHERE dict_name = ?1",
                params![self.core.name()],
            )?;
            Ok(())
        })
    }

    /// Serialize the whole dictionary to a JSON object.
    pub fn dump(&self) -> Result<Value> {
        let items = self.items::<Value>()?;
        let map: serde_json::Map<String, Value> = items.into_iter().collect();
        Ok(json!({
            "metadata": {
                "type": "Dict",
                "name": self.core.name(),
                "count": map.len(),
            },
            "items": map,
        }))
    }
}
