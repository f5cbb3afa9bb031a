//! LogManager: a time-indexed append-only log with live tailing
//!
//! ## Timestamp uniqueness
//!
//! `(log_name, timestamp)` is the primary key. When two appends land in the
//! same microsecond the second insert violates the key; the writer steps
//! its candidate timestamp forward one microsecond and retries until the
//! insert succeeds. The result is a unique, monotonic timestamp per log
//! without a separate sequence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use beaver_concurrency::{CacheRegistry, LockGuard};
use beaver_core::{from_json, now, to_json, Error, Result, MICROSECOND};
use beaver_storage::Storage;

use crate::manager::ManagerCore;

/// A single entry read back from a log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// The entry's unique, monotonic timestamp within its log.
    pub timestamp: f64,
    /// The payload.
    pub data: Value,
}

impl LogEntry {
    /// Deserialize the payload into a typed value.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Bounds and limit for a range query.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeQuery {
    /// Inclusive lower bound on timestamps.
    pub start: Option<f64>,
    /// Inclusive upper bound on timestamps.
    pub end: Option<f64>,
    /// Maximum number of entries to return.
    pub limit: Option<u64>,
}

/// A named append-only log stored in `beaver_logs`.
pub struct LogManager {
    core: ManagerCore,
}

impl LogManager {
    pub(crate) const KIND: &'static str = "log";

    /// Create the manager for `name`.
    pub fn new(name: &str, storage: Arc<Storage>, caches: Arc<CacheRegistry>) -> Result<Self> {
        Ok(LogManager {
            core: ManagerCore::new(Self::KIND, name, storage, caches)?,
        })
    }

    /// The log's name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Acquire the public lock for a batch of operations.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.core.lock_guard()
    }

    /// Append an entry, defaulting the timestamp to now. Returns the
    /// timestamp actually used after collision retries.
    pub fn append<T: Serialize>(&self, data: &T, timestamp: Option<f64>) -> Result<f64> {
        let raw = to_json(data)?;
        self.core.mutate(|tx| {
            let mut ts = timestamp.unwrap_or_else(now);
            loop {
                let result = tx.execute(
                    "INSERT INTO beaver_logs (log_name, timestamp, data) VALUES (?1, ?2, ?3)",
                    params![self.core.name(), ts, raw],
                );
                match result {
                    Ok(_) => return Ok(ts),
                    Err(err) => {
                        let err = Error::from(err);
                        if err.is_constraint_violation() {
                            // Same microsecond as an existing entry: shift
                            // and retry.
                            tracing::trace!(log = %self.core.name(), ts, "timestamp collision");
                            ts += MICROSECOND;
                        } else {
                            return Err(err);
                        }
                    }
                }
            }
        })
    }

    fn query_range(&self, conn: &Connection, query: &RangeQuery) -> Result<Vec<LogEntry>> {
        let mut sql = String::from(
            "SELECT timestamp, data FROM beaver_logs WHERE log_name = ?1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(self.core.name().to_string())];

        if let Some(start) = query.start {
            sql.push_str(" AND timestamp >= ?");
            params.push(Box::new(start));
        }
        if let Some(end) = query.end {
            sql.push_str(" AND timestamp <= ?");
            params.push(Box::new(end));
        }
        sql.push_str(" ORDER BY timestamp ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            params.push(Box::new(limit as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(&param_refs[..], |row| {
            Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (timestamp, raw) = row?;
            entries.push(LogEntry {
                timestamp,
                data: from_json(&raw)?,
            });
        }
        Ok(entries)
    }

    /// Entries within a time range, oldest first.
    pub fn range(&self, query: &RangeQuery) -> Result<Vec<LogEntry>> {
        self.core.read(|conn| self.query_range(conn, query))
    }

    /// An infinite iterator over entries appended after this call, polling
    /// every `poll_interval` seconds. Ends (returns `None`) when the
    /// database closes.
    pub fn live(&self, poll_interval: f64) -> LiveTail {
        LiveTail {
            storage: Arc::clone(self.core.storage()),
            log_name: self.core.name().to_string(),
            poll_interval,
            last_seen: now(),
            pending: VecDeque::new(),
        }
    }

    /// Total number of entries.
    pub fn count(&self) -> Result<u64> {
        self.core.cached_read(Some("count".into()), |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM beaver_logs WHERE log_name = ?1",
                params![self.core.name()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Remove every entry in this log.
    pub fn clear(&self) -> Result<()> {
        self.core.mutate(|tx| {
            tx.execute(
                "DELETE FROM beaver_logs WHERE log_name = ?1",
                params![self.core.name()],
            )?;
            Ok(())
        })
    }

    /// Serialize the whole log to a JSON object, oldest first.
    pub fn dump(&self) -> Result<Value> {
        let entries = self.range(&RangeQuery::default())?;
        let items: Vec<Value> = entries
            .iter()
            .map(|entry| json!({"timestamp": entry.timestamp, "data": entry.data}))
            .collect();
        Ok(json!({
            "metadata": {
                "type": "Log",
                "name": self.core.name(),
                "count": items.len(),
            },
            "items": items,
        }))
    }
}

/// Iterator returned by [`LogManager::live`].
///
/// Remembers the highest timestamp seen and polls for strictly newer
/// entries, sleeping `poll_interval` between empty passes. Terminates
/// cleanly when the database closes.
pub struct LiveTail {
    storage: Arc<Storage>,
    log_name: String,
    poll_interval: f64,
    last_seen: f64,
    pending: VecDeque<LogEntry>,
}

impl Iterator for LiveTail {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            if self.storage.is_closed() {
                return None;
            }

            let batch = self.storage.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, data FROM beaver_logs
                     WHERE log_name = ?1 AND timestamp > ?2
                     ORDER BY timestamp ASC",
                )?;
                let rows = stmt.query_map(params![self.log_name, self.last_seen], |row| {
                    Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?))
                })?;

                let mut entries = Vec::new();
                for row in rows {
                    let (timestamp, raw) = row?;
                    entries.push(LogEntry {
                        timestamp,
                        data: from_json(&raw)?,
                    });
                }
                Ok(entries)
            });

            match batch {
                Ok(entries) if !entries.is_empty() => {
                    self.last_seen = entries.last().map(|e| e.timestamp).unwrap_or(self.last_seen);
                    self.pending.extend(entries);
                }
                Ok(_) => {
                    std::thread::sleep(Duration::from_secs_f64(self.poll_interval));
                }
                Err(Error::Closed) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
