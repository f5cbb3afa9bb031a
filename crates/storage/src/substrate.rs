//! Storage substrate: per-thread connections to the single file
//!
//! ## Design
//!
//! `Storage` owns the database path and a table of connections keyed by
//! `ThreadId`. Each thread gets its own connection, created lazily on first
//! use and reused until close; SQLite connections must not be shared across
//! threads, and giving every thread a private one sidesteps statement-level
//! locking entirely. The table itself is guarded by a `RwLock`; the
//! per-thread entry is wrapped in a `Mutex` that is only ever contended by
//! its owning thread, so locking it is effectively free.
//!
//! ## In-memory databases
//!
//! Every connection to `:memory:` would be a *different* database, so an
//! in-memory `Storage` is confined to its creating thread. Use from any
//! other thread fails with a misuse error.
//!
//! ## Close semantics
//!
//! `close()` flips the terminated flag, closes the calling thread's
//! connection, and makes every later access fail with `Error::Closed`.
//! Other threads' connections drop when their map entries do. Polling
//! iterators (queue get, channel subscribers, live log tails) observe the
//! flag between passes and exit promptly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, TransactionBehavior};

use beaver_core::{Error, Result};

use crate::registry;
use crate::schema;

/// Options controlling how the database file is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// How long a statement waits on a locked file before failing.
    pub busy_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared handle to the single database file.
///
/// Cheap to clone via `Arc`; every manager holds one.
pub struct Storage {
    path: String,
    busy_timeout: Duration,
    in_memory: bool,
    creator: ThreadId,
    closed: AtomicBool,
    connections: RwLock<HashMap<ThreadId, Arc<Mutex<Connection>>>>,
}

impl Storage {
    /// Open (or create) the database file and bootstrap the schema.
    ///
    /// `path = ":memory:"` creates a non-shareable in-memory instance
    /// confined to the calling thread.
    pub fn open(path: &str, options: OpenOptions) -> Result<Arc<Self>> {
        let storage = Arc::new(Storage {
            path: path.to_string(),
            busy_timeout: options.busy_timeout,
            in_memory: path == ":memory:",
            creator: thread::current().id(),
            closed: AtomicBool::new(false),
            connections: RwLock::new(HashMap::new()),
        });

        // First connection for the opening thread; creates all tables.
        storage.with_conn(|conn| schema::create_all_tables(conn))?;

        Ok(storage)
    }

    /// The path this storage was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this is a `:memory:` instance.
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail with `Error::Closed` if the instance is terminated.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        self.ensure_open()?;

        let current = thread::current().id();
        if self.in_memory && current != self.creator {
            return Err(Error::Misuse(
                "in-memory database is confined to the thread that created it".into(),
            ));
        }

        if let Some(conn) = self.connections.read().get(&current) {
            return Ok(Arc::clone(conn));
        }

        let mut table = self.connections.write();
        // Another call on this thread cannot have raced us, but re-check to
        // keep the insert idempotent.
        if let Some(conn) = table.get(&current) {
            return Ok(Arc::clone(conn));
        }

        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_row| Ok(()))?;
        tracing::debug!(path = %self.path, thread = ?current, "opened connection");

        let conn = Arc::new(Mutex::new(conn));
        table.insert(current, Arc::clone(&conn));
        Ok(conn)
    }

    /// Run a closure against this thread's connection.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.connection()?;
        let guard = conn.lock();
        f(&guard)
    }

    /// Run a closure inside a single write transaction (`BEGIN IMMEDIATE`).
    ///
    /// The closure's statements either all commit or all roll back; an `Err`
    /// return rolls back.
    pub fn with_txn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.connection()?;
        let mut guard = conn.lock();
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Bump the monotonic version counter for `namespace`, returning the new
    /// value. Observable by every other process as soon as it commits.
    pub fn bump_version(&self, namespace: &str) -> Result<u64> {
        self.with_conn(|conn| registry::bump(conn, namespace))
    }

    /// Read the current version for `namespace`; missing records read as 0.
    pub fn read_version(&self, namespace: &str) -> Result<u64> {
        self.with_conn(|conn| registry::read(conn, namespace))
    }

    /// Distinct user-visible names in `column` of `table`, excluding
    /// internal names (those starting with `__`).
    ///
    /// `table` and `column` are internal constants, never caller input.
    pub fn distinct_names(&self, table: &str, column: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT DISTINCT {column} FROM {table} \
                 WHERE {column} NOT LIKE '\\_\\_%' ESCAPE '\\' \
                 ORDER BY {column} ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    /// Mark the instance terminated and close the calling thread's
    /// connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = thread::current().id();
        self.connections.write().remove(&current);
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("in_memory", &self.in_memory)
            .field("closed", &self.is_closed())
            .finish()
    }
}
