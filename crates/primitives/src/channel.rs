//! ChannelManager: pub/sub over a globally ordered message log
//!
//! Publishing inserts a row into `beaver_pubsub_log`, whose timestamp is
//! the global primary key (collisions retry at microsecond steps, the same
//! shape as the log manager). Subscribers are polling iterators that
//! remember the last timestamp they saw; no per-subscriber state touches
//! disk, so a late subscriber starts from "now". Closing the database ends
//! every subscriber cleanly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use beaver_concurrency::{CacheRegistry, LockGuard};
use beaver_core::{from_json, now, to_json, Error, Result, MICROSECOND};
use beaver_storage::Storage;

use crate::manager::ManagerCore;

/// A message read back from a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The message's globally unique timestamp.
    pub timestamp: f64,
    /// The payload.
    pub payload: Value,
}

impl Message {
    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A named pub/sub channel backed by `beaver_pubsub_log`.
pub struct ChannelManager {
    core: ManagerCore,
}

impl ChannelManager {
    pub(crate) const KIND: &'static str = "channel";

    /// Create the manager for `name`.
    pub fn new(name: &str, storage: Arc<Storage>, caches: Arc<CacheRegistry>) -> Result<Self> {
        Ok(ChannelManager {
            core: ManagerCore::new(Self::KIND, name, storage, caches)?,
        })
    }

    /// The channel's name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Acquire the public lock for a batch of operations.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.core.lock_guard()
    }

    /// Publish a message. Returns the timestamp assigned after collision
    /// retries.
    pub fn publish<T: Serialize>(&self, payload: &T) -> Result<f64> {
        let raw = to_json(payload)?;
        self.core.mutate(|tx| {
            let mut ts = now();
            loop {
                let result = tx.execute(
                    "INSERT INTO beaver_pubsub_log (timestamp, channel_name, message_payload)
                     VALUES (?1, ?2, ?3)",
                    params![ts, self.core.name(), raw],
                );
                match result {
                    Ok(_) => return Ok(ts),
                    Err(err) => {
                        let err = Error::from(err);
                        if err.is_constraint_violation() {
                            // The timestamp PK is global across channels.
                            tracing::trace!(channel = %self.core.name(), ts, "timestamp collision");
                            ts += MICROSECOND;
                        } else {
                            return Err(err);
                        }
                    }
                }
            }
        })
    }

    /// Subscribe from "now": an iterator over messages published after this
    /// call, polling every `poll_interval` seconds. Ends when the database
    /// closes.
    pub fn subscribe(&self, poll_interval: f64) -> Subscriber {
        Subscriber {
            storage: Arc::clone(self.core.storage()),
            channel: self.core.name().to_string(),
            poll_interval,
            last_seen: now(),
            pending: VecDeque::new(),
        }
    }

    /// Serialize the channel's backlog to a JSON object, oldest first.
    pub fn dump(&self) -> Result<Value> {
        let items = self.core.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, message_payload FROM beaver_pubsub_log
                 WHERE channel_name = ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![self.core.name()], |row| {
                Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut items = Vec::new();
            for row in rows {
                let (timestamp, raw) = row?;
                items.push(json!({
                    "timestamp": timestamp,
                    "payload": from_json::<Value>(&raw)?,
                }));
            }
            Ok(items)
        })?;

        Ok(json!({
            "metadata": {
                "type": "Channel",
                "name": self.core.name(),
                "count": items.len(),
            },
            "items": items,
        }))
    }
}

/// Iterator returned by [`ChannelManager::subscribe`].
///
/// Each pass drains every message with `timestamp > last_seen` for the
/// channel (at least one per pass when a backlog exists), then sleeps
/// `poll_interval`. Terminates when the database closes.
pub struct Subscriber {
    storage: Arc<Storage>,
    channel: String,
    poll_interval: f64,
    last_seen: f64,
    pending: VecDeque<Message>,
}

impl Iterator for Subscriber {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(Ok(message));
            }
            if self.storage.is_closed() {
                return None;
            }

            let batch = self.storage.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, message_payload FROM beaver_pubsub_log
                     WHERE channel_name = ?1 AND timestamp > ?2
                     ORDER BY timestamp ASC",
                )?;
                let rows = stmt.query_map(params![self.channel, self.last_seen], |row| {
                    Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?))
                })?;

                let mut messages = Vec::new();
                for row in rows {
                    let (timestamp, raw) = row?;
                    messages.push(Message {
                        timestamp,
                        payload: from_json(&raw)?,
                    });
                }
                Ok(messages)
            });

            match batch {
                Ok(messages) if !messages.is_empty() => {
                    self.last_seen = messages
                        .last()
                        .map(|m| m.timestamp)
                        .unwrap_or(self.last_seen);
                    self.pending.extend(messages);
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
