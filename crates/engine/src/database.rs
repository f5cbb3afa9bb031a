//! Database facade: open/close, manager factories, discovery
//!
//! ## Design
//!
//! `Database` owns the storage substrate, the cache registry, and a map of
//! every manager handed out so far, keyed by `(kind, name)`. Factories
//! return process-singletons: `db.dict("tasks")` always yields the same
//! `Arc<DictManager>` for the lifetime of the handle, so all threads share
//! one public lock and one vector index per name.
//!
//! Closing flips the substrate's terminated flag (polling iterators observe
//! it between passes), drops the manager map, and closes the calling
//! thread's connection. Close is idempotent; every operation after it fails
//! with `Error::Closed`.
//!
//! On first open the `__metadata__` dict records the library version. A
//! reopen under a different library version logs a warning and continues;
//! version skew is never fatal.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use beaver_concurrency::{BeaverLock, CacheRegistry, LockOptions};
use beaver_core::{Error, Result};
use beaver_primitives::{
    BlobManager, ChannelManager, DictManager, ListManager, LogManager, QueueManager,
    SketchManager,
};
use beaver_search::CollectionManager;
use beaver_storage::{OpenOptions, Storage};

/// Library version stamped into the `__metadata__` dict.
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Options for [`Database::open_with`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// How long a statement waits on a locked file before failing.
    pub busy_timeout: Duration,
    /// Whether reads go through the coherent per-thread caches.
    pub enable_cache: bool,
    /// Seconds between cache revalidations against the version registry.
    pub cache_check_interval: f64,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions {
            busy_timeout: Duration::from_secs(30),
            enable_cache: true,
            cache_check_interval: CacheRegistry::DEFAULT_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ManagerKind {
    Dict,
    List,
    Queue,
    Blob,
    Log,
    Channel,
    Sketch,
    Collection,
}

enum ManagerEntry {
    Dict(Arc<DictManager>),
    List(Arc<ListManager>),
    Queue(Arc<QueueManager>),
    Blob(Arc<BlobManager>),
    Log(Arc<LogManager>),
    Channel(Arc<ChannelManager>),
    Sketch(Arc<SketchManager>),
    Collection(Arc<CollectionManager>),
}

/// An embedded, multi-modal data store in a single SQLite file.
pub struct Database {
    storage: Arc<Storage>,
    caches: Arc<CacheRegistry>,
    managers: Mutex<HashMap<(ManagerKind, String), ManagerEntry>>,
}

impl Database {
    /// Open (or create) the store at `path` with default options.
    ///
    /// `path = ":memory:"` creates a non-shareable instance confined to the
    /// calling thread.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, DatabaseOptions::default())
    }

    /// Open with explicit options.
    pub fn open_with(path: &str, options: DatabaseOptions) -> Result<Self> {
        let storage = Storage::open(
            path,
            OpenOptions {
                busy_timeout: options.busy_timeout,
            },
        )?;
        let caches = Arc::new(CacheRegistry::new(
            Arc::clone(&storage),
            options.enable_cache,
            options.cache_check_interval,
        ));

        let db = Database {
            storage,
            caches,
            managers: Mutex::new(HashMap::new()),
        };
        db.check_version()?;
        Ok(db)
    }

    fn check_version(&self) -> Result<()> {
        let metadata = self.dict("__metadata__")?;
        let stored: Option<String> = metadata.get("version")?;

        match stored {
            Some(stored) if stored != LIBRARY_VERSION => {
                tracing::warn!(
                    db_version = %stored,
                    library_version = LIBRARY_VERSION,
                    "version mismatch: the store was created by a different library version"
                );
            }
            Some(_) => {}
            None => {
                metadata.set("version", &LIBRARY_VERSION, None)?;
            }
        }
        Ok(())
    }

    /// The library version recorded in the store.
    pub fn version(&self) -> Result<String> {
        self.dict("__metadata__")?.try_get("version")
    }

    /// The underlying storage substrate.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }

    /// Close the store: signal every polling iterator, drop the manager
    /// registry, and close the calling thread's connection. Idempotent.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.managers.lock().clear();
        self.storage.close();
    }

    fn entry<M>(
        &self,
        kind: ManagerKind,
        name: &str,
        build: impl FnOnce() -> Result<(ManagerEntry, Arc<M>)>,
        extract: impl FnOnce(&ManagerEntry) -> Option<Arc<M>>,
    ) -> Result<Arc<M>> {
        self.storage.ensure_open()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "manager name must be a non-empty string".into(),
            ));
        }

        let mut managers = self.managers.lock();
        match managers.entry((kind, name.to_string())) {
            Entry::Occupied(occupied) => extract(occupied.get()).ok_or_else(|| {
                Error::InvalidArgument(format!("manager '{name}' exists with a different kind"))
            }),
            Entry::Vacant(vacant) => {
                let (entry, manager) = build()?;
                vacant.insert(entry);
                Ok(manager)
            }
        }
    }

    /// The process-singleton dictionary manager for `name`.
    pub fn dict(&self, name: &str) -> Result<Arc<DictManager>> {
        self.entry(
            ManagerKind::Dict,
            name,
            || {
                let manager = Arc::new(DictManager::new(
                    name,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.caches),
                )?);
                Ok((ManagerEntry::Dict(Arc::clone(&manager)), manager))
            },
            |entry| match entry {
                ManagerEntry::Dict(manager) => Some(Arc::clone(manager)),
                _ => None,
            },
        )
    }

    /// The process-singleton list manager for `name`.
    pub fn list(&self, name: &str) -> Result<Arc<ListManager>> {
        self.entry(
            ManagerKind::List,
            name,
            || {
                let manager = Arc::new(ListManager::new(
                    name,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.caches),
                )?);
                Ok((ManagerEntry::List(Arc::clone(&manager)), manager))
            },
            |entry| match entry {
                ManagerEntry::List(manager) => Some(Arc::clone(manager)),
                _ => None,
            },
        )
    }

    /// The process-singleton priority-queue manager for `name`.
    pub fn queue(&self, name: &str) -> Result<Arc<QueueManager>> {
        self.entry(
            ManagerKind::Queue,
            name,
            || {
                let manager = Arc::new(QueueManager::new(
                    name,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.caches),
                )?);
                Ok((ManagerEntry::Queue(Arc::clone(&manager)), manager))
            },
            |entry| match entry {
                ManagerEntry::Queue(manager) => Some(Arc::clone(manager)),
                _ => None,
            },
        )
    }

    /// The process-singleton blob-store manager for `name`.
    pub fn blob(&self, name: &str) -> Result<Arc<BlobManager>> {
        self.entry(
            ManagerKind::Blob,
            name,
            || {
                let manager = Arc::new(BlobManager::new(
                    name,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.caches),
                )?);
                Ok((ManagerEntry::Blob(Arc::clone(&manager)), manager))
            },
            |entry| match entry {
                ManagerEntry::Blob(manager) => Some(Arc::clone(manager)),
                _ => None,
            },
        )
    }

    /// The process-singleton log manager for `name`.
    pub fn log(&self, name: &str) -> Result<Arc<LogManager>> {
        self.entry(
            ManagerKind::Log,
            name,
            || {
                let manager = Arc::new(LogManager::new(
                    name,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.caches),
                )?);
                Ok((ManagerEntry::Log(Arc::clone(&manager)), manager))
            },
            |entry| match entry {
                ManagerEntry::Log(manager) => Some(Arc::clone(manager)),
                _ => None,
            },
        )
    }

    /// The process-singleton channel manager for `name`.
    pub fn channel(&self, name: &str) -> Result<Arc<ChannelManager>> {
        self.entry(
            ManagerKind::Channel,
            name,
            || {
                let manager = Arc::new(ChannelManager::new(
                    name,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.caches),
                )?);
                Ok((ManagerEntry::Channel(Arc::clone(&manager)), manager))
            },
            |entry| match entry {
                ManagerEntry::Channel(manager) => Some(Arc::clone(manager)),
                _ => None,
            },
        )
    }

    /// The process-singleton sketch manager for `name` with the default
    /// sizing (one million items at 1% error).
    pub fn sketch(&self, name: &str) -> Result<Arc<SketchManager>> {
        self.sketch_with(name, 1_000_000, 0.01)
    }

    /// The process-singleton sketch manager for `name`.
    ///
    /// Sizing parameters apply on first creation; later calls return the
    /// existing handle. Reopening a persisted sketch with different
    /// parameters fails with *invalid-argument*.
    pub fn sketch_with(
        &self,
        name: &str,
        capacity: u64,
        error_rate: f64,
    ) -> Result<Arc<SketchManager>> {
        self.entry(
            ManagerKind::Sketch,
            name,
            || {
                let manager = Arc::new(SketchManager::new(
                    name,
                    capacity,
                    error_rate,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.caches),
                )?);
                Ok((ManagerEntry::Sketch(Arc::clone(&manager)), manager))
            },
            |entry| match entry {
                ManagerEntry::Sketch(manager) => Some(Arc::clone(manager)),
                _ => None,
            },
        )
    }

    /// The process-singleton collection manager for `name`.
    pub fn collection(&self, name: &str) -> Result<Arc<CollectionManager>> {
        self.entry(
            ManagerKind::Collection,
            name,
            || {
                let manager = Arc::new(CollectionManager::new(
                    name,
                    Arc::clone(&self.storage),
                    Arc::clone(&self.caches),
                )?);
                Ok((ManagerEntry::Collection(Arc::clone(&manager)), manager))
            },
            |entry| match entry {
                ManagerEntry::Collection(manager) => Some(Arc::clone(manager)),
                _ => None,
            },
        )
    }

    /// A fresh inter-process lock handle for `name`.
    ///
    /// Lock handles carry per-instance waiter identity, so they are not
    /// singletons: two handles for the same name contend with each other.
    pub fn lock(&self, name: &str, options: LockOptions) -> Result<BeaverLock> {
        self.storage.ensure_open()?;
        BeaverLock::new(Arc::clone(&self.storage), name, options)
    }

    // ========== Name discovery ==========

    /// Names of all user-defined dictionaries.
    pub fn dicts(&self) -> Result<Vec<String>> {
        self.storage.distinct_names("beaver_dicts", "dict_name")
    }

    /// Names of all user-defined lists.
    pub fn lists(&self) -> Result<Vec<String>> {
        self.storage.distinct_names("beaver_lists", "list_name")
    }

    /// Names of all user-defined queues.
    pub fn queues(&self) -> Result<Vec<String>> {
        self.storage
            .distinct_names("beaver_priority_queues", "queue_name")
    }

    /// Names of all user-defined blob stores.
    pub fn blobs(&self) -> Result<Vec<String>> {
        self.storage.distinct_names("beaver_blobs", "store_name")
    }

    /// Names of all user-defined logs.
    pub fn logs(&self) -> Result<Vec<String>> {
        self.storage.distinct_names("beaver_logs", "log_name")
    }

    /// Names of all user-defined channels.
    pub fn channels(&self) -> Result<Vec<String>> {
        self.storage
            .distinct_names("beaver_pubsub_log", "channel_name")
    }

    /// Names of all user-defined sketches.
    pub fn sketches(&self) -> Result<Vec<String>> {
        self.storage.distinct_names("beaver_sketches", "name")
    }

    /// Names of all user-defined collections.
    pub fn collections(&self) -> Result<Vec<String>> {
        self.storage
            .distinct_names("beaver_collections", "collection")
    }

    /// Names of all locks with live waiters.
    pub fn locks(&self) -> Result<Vec<String>> {
        self.storage
            .distinct_names("beaver_lock_waiters", "lock_name")
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.storage.path())
            .field("closed", &self.is_closed())
            .finish()
    }
}
