//! Shared plumbing for the named data-structure managers
//!
//! ## Design
//!
//! Every manager is a concrete struct around a [`ManagerCore`] carrying its
//! `(kind, name)` identity, the storage handle, the cache registry, and the
//! public inter-process lock (`__lock__{kind}__{name}`) used for
//! coarse-grained batching. The cache namespace is `{kind}:{name}` and is
//! also the key the version registry tracks for coherence.
//!
//! Two helpers encode the read/write contracts:
//! - [`ManagerCore::cached_read`]: consult the thread-local cache unless
//!   the caller holds the public lock; on miss compute and store.
//! - [`ManagerCore::mutate`]: run the write inside one transaction together
//!   with the namespace version bump, then clear the local cache whether
//!   the write succeeded or failed, and on success adopt the new version so
//!   the writer's own cache stays warm.

use std::sync::Arc;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;

use beaver_concurrency::{BeaverLock, Cache, CacheRegistry, LockGuard, LockOptions};
use beaver_core::{Error, Result};
use beaver_storage::{registry, Storage};

/// Identity and shared handles for one named manager.
pub struct ManagerCore {
    kind: &'static str,
    name: String,
    storage: Arc<Storage>,
    caches: Arc<CacheRegistry>,
    lock: BeaverLock,
}

impl ManagerCore {
    /// Build the core for `(kind, name)`. Empty names are rejected.
    pub fn new(
        kind: &'static str,
        name: &str,
        storage: Arc<Storage>,
        caches: Arc<CacheRegistry>,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{kind} name must be a non-empty string"
            )));
        }

        let lock = BeaverLock::new(
            Arc::clone(&storage),
            &format!("__lock__{kind}__{name}"),
            LockOptions::default(),
        )?;

        Ok(ManagerCore {
            kind,
            name: name.to_string(),
            storage,
            caches,
            lock,
        })
    }

    /// The manager's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `{kind}:{name}` namespace driving cache coherence.
    pub fn namespace(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    /// The storage substrate.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The public inter-process lock for scoped batching.
    pub fn lock(&self) -> &BeaverLock {
        &self.lock
    }

    /// Acquire the public lock, returning a guard that releases on drop.
    pub fn lock_guard(&self) -> Result<LockGuard<'_>> {
        self.lock.guard()
    }

    /// The calling thread's cache for this namespace.
    pub fn cache(&self) -> Arc<dyn Cache> {
        self.caches.cache(&self.namespace())
    }

    /// Run a read-only closure against this thread's connection.
    pub fn read<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        self.storage.with_conn(f)
    }

    /// Cached read: serve from the thread-local cache when `key` is present
    /// and the public lock is not held; otherwise compute, then store.
    pub fn cached_read<R>(
        &self,
        key: Option<String>,
        compute: impl FnOnce(&Connection) -> Result<R>,
    ) -> Result<R>
    where
        R: Serialize + DeserializeOwned,
    {
        let Some(key) = key else {
            return self.read(compute);
        };

        let cache = self.cache();
        if !self.lock.is_acquired() {
            if let Some(raw) = cache.get(&key)? {
                if let Ok(value) = serde_json::from_value::<R>(raw) {
                    return Ok(value);
                }
            }
        }

        let value = self.read(compute)?;
        if let Ok(raw) = serde_json::to_value(&value) {
            cache.set(&key, raw);
        }
        Ok(value)
    }

    /// Run a mutation inside one write transaction together with the
    /// namespace version bump, then apply the invalidates-write contract.
    pub fn mutate<R>(&self, op: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let result = self.storage.with_txn(|tx| {
            let value = op(tx)?;
            let version = registry::bump(tx, &self.namespace())?;
            Ok((value, version))
        });

        // Clear the caller's cache whether the write landed or not.
        let cache = self.cache();
        cache.invalidate();

        match result {
            Ok((value, version)) => {
                cache.sync(version);
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for ManagerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerCore")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beaver_storage::OpenOptions;
    use tempfile::TempDir;

    fn open_core() -> (TempDir, ManagerCore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mgr.db");
        let storage = Storage::open(path.to_str().unwrap(), OpenOptions::default()).unwrap();
        let caches = Arc::new(CacheRegistry::new(
            Arc::clone(&storage),
            true,
            CacheRegistry::DEFAULT_CHECK_INTERVAL,
        ));
        let core = ManagerCore::new("dict", "tasks", storage, caches).unwrap();
        (dir, core)
    }

    #[test]
    fn empty_name_is_rejected() {
        let (_dir, core) = open_core();
        let result = ManagerCore::new(
            "dict",
            "",
            Arc::clone(core.storage()),
            Arc::new(CacheRegistry::new(Arc::clone(core.storage()), true, 0.1)),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn namespace_and_lock_name() {
        let (_dir, core) = open_core();
        assert_eq!(core.namespace(), "dict:tasks");
        assert_eq!(core.lock().name(), "__lock__dict__tasks");
    }

    #[test]
    fn mutate_bumps_version_and_keeps_own_cache_valid() {
        let (_dir, core) = open_core();

        core.mutate(|tx| {
            tx.execute(
                "INSERT INTO beaver_dicts (dict_name, key, value) VALUES ('tasks', 'k', '1')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        assert_eq!(core.storage().read_version("dict:tasks").unwrap(), 1);

        // The writer's next cached read stores and then serves from memory.
        let first: i64 = core
            .cached_read(Some("len".into()), |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM beaver_dicts", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(first, 1);
        let stats = core.cache().stats();
        assert_eq!(stats.sets, 1);
    }

    #[test]
    fn failed_mutation_still_invalidates() {
        let (_dir, core) = open_core();

        // Warm the cache.
        let _: i64 = core
            .cached_read(Some("len".into()), |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM beaver_dicts", [], |r| r.get(0))?)
            })
            .unwrap();

        let result: Result<()> = core.mutate(|_tx| Err(Error::Corruption("induced".into())));
        assert!(result.is_err());
        // Version unchanged on rollback, cache cleared regardless.
        assert_eq!(core.storage().read_version("dict:tasks").unwrap(), 0);
        assert!(core.cache().get("len").unwrap().is_none());
    }

    #[test]
    fn cached_read_bypasses_while_locked() {
        let (_dir, core) = open_core();
        let guard = core.lock_guard().unwrap();

        let _: i64 = core
            .cached_read(Some("len".into()), |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM beaver_dicts", [], |r| r.get(0))?)
            })
            .unwrap();
        // Stored but not consulted: a second read recomputes.
        let _: i64 = core
            .cached_read(Some("len".into()), |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM beaver_dicts", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(core.cache().stats().hits, 0);
        drop(guard);
    }
}
