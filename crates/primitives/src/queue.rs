//! QueueManager: a persistent priority queue with blocking consumption
//!
//! Total order is `(priority ASC, timestamp ASC)`: lower priority numbers
//! are served first, and equal priorities are FIFO by insertion time.
//! Retrieval deletes the head row inside the same transaction, so an item
//! is consumed exactly once even with competing consumers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use beaver_concurrency::{CacheRegistry, LockGuard};
use beaver_core::{from_json, now, to_json, Error, Result};
use beaver_storage::Storage;

use crate::manager::ManagerCore;

/// Seconds between polls while a blocking `get` waits for an item.
const BLOCKING_POLL_INTERVAL: f64 = 0.05;

/// A single item retrieved from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    /// The item's priority; lower is served sooner.
    pub priority: f64,
    /// Insertion time, the FIFO tie-break among equal priorities.
    pub timestamp: f64,
    /// The payload.
    pub data: Value,
}

impl QueueItem {
    /// Deserialize the payload into a typed value.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// A named priority queue stored in `beaver_priority_queues`.
pub struct QueueManager {
    core: ManagerCore,
}

impl QueueManager {
    pub(crate) const KIND: &'static str = "queue";

    /// Create the manager for `name`.
    pub fn new(name: &str, storage: Arc<Storage>, caches: Arc<CacheRegistry>) -> Result<Self> {
        Ok(QueueManager {
            core: ManagerCore::new(Self::KIND, name, storage, caches)?,
        })
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Acquire the public lock for a batch of operations.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.core.lock_guard()
    }

    /// Add an item with the given priority (lower is served sooner).
    pub fn put<T: Serialize>(&self, value: &T, priority: f64) -> Result<()> {
        let raw = to_json(value)?;
        self.core.mutate(|tx| {
            tx.execute(
                "INSERT INTO beaver_priority_queues (queue_name, priority, timestamp, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![self.core.name(), priority, now(), raw],
            )?;
            Ok(())
        })
    }

    /// Atomically remove and return the head item, failing with *empty*
    /// when there is none.
    pub fn try_get(&self) -> Result<QueueItem> {
        self.core.mutate(|tx| {
            let row: Option<(i64, f64, f64, String)> = tx
                .query_row(
                    "SELECT rowid, priority, timestamp, data FROM beaver_priority_queues
                     WHERE queue_name = ?1
                     ORDER BY priority ASC, timestamp ASC
                     LIMIT 1",
                    params![self.core.name()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((rowid, priority, timestamp, raw)) = row else {
                return Err(Error::Empty(self.core.name().to_string()));
            };

            tx.execute(
                "DELETE FROM beaver_priority_queues WHERE rowid = ?1",
                params![rowid],
            )?;

            Ok(QueueItem {
                priority,
                timestamp,
                data: from_json(&raw)?,
            })
        })
    }

    /// Blocking retrieval: poll until an item appears, the database closes,
    /// or `timeout` elapses.
    pub fn get(&self, timeout: Option<f64>) -> Result<QueueItem> {
        let start = Instant::now();
        loop {
            self.core.storage().ensure_open()?;

            match self.try_get() {
                Err(Error::Empty(_)) => {}
                other => return other,
            }

            if let Some(timeout) = timeout {
                if start.elapsed().as_secs_f64() > timeout {
                    return Err(Error::Timeout(format!(
                        "no item arrived on queue '{}' within {timeout}s",
                        self.core.name()
                    )));
                }
            }
            std::thread::sleep(Duration::from_secs_f64(BLOCKING_POLL_INTERVAL));
        }
    }

    /// The head item without removing it, or `None` on an empty queue.
    pub fn peek(&self) -> Result<Option<QueueItem>> {
        self.core.read(|conn| {
            let row: Option<(f64, f64, String)> = conn
                .query_row(
                    "SELECT priority, timestamp, data FROM beaver_priority_queues
                     WHERE queue_name = ?1
                     ORDER BY priority ASC, timestamp ASC
                     LIMIT 1",
                    params![self.core.name()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match row {
                Some((priority, timestamp, raw)) => Ok(Some(QueueItem {
                    priority,
                    timestamp,
                    data: from_json(&raw)?,
                })),
                None => Ok(None),
            }
        })
    }

    /// Number of queued items.
    pub fn len(&self) -> Result<u64> {
        self.core.cached_read(Some("len".into()), |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM beaver_priority_queues WHERE queue_name = ?1",
                params![self.core.name()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Whether the queue has no items.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ordered snapshot of the queue, head first, without consuming.
    pub fn iter(&self) -> Result<std::vec::IntoIter<QueueItem>> {
        let items = self.core.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT priority, timestamp, data FROM beaver_priority_queues
                 WHERE queue_name = ?1
                 ORDER BY priority ASC, timestamp ASC",
            )?;
            let rows = stmt.query_map(params![self.core.name()], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut items = Vec::new();
            for row in rows {
                let (priority, timestamp, raw) = row?;
                items.push(QueueItem {
                    priority,
                    timestamp,
                    data: from_json(&raw)?,
                });
            }
            Ok(items)
        })?;
        Ok(items.into_iter())
    }

    /// Remove every queued item.
    pub fn clear(&self) -> Result<()> {
        self.core.mutate(|tx| {
            tx.execute(
                "DELETE FROM beaver_priority_queues WHERE queue_name = ?1",
                params![self.core.name()],
            )?;
            Ok(())
        })
    }

    /// Serialize the whole queue to a JSON object, head first.
    pub fn dump(&self) -> Result<Value> {
        let items: Vec<Value> = self
            .iter()?
            .map(|item| {
                json!({
                    "priority": item.priority,
                    "timestamp": item.timestamp,
                    "data": item.data,
                })
            })
            .collect();
        Ok(json!({
            "metadata": {
                "type": "Queue",
                "name": self.core.name(),
                "count": items.len(),
            },
            "items": items,
        }))
    }
}
