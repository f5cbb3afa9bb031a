//! Two-tier in-memory vector index with change-log synchronization
//!
//! ## Design
//!
//! Each collection keeps a per-process index split into two tiers:
//! - **Base**: the compacted view, rebuilt wholesale from the document
//!   table on first load and after every compaction.
//! - **Delta**: recent inserts applied from the shared `_vector_change_log`
//!   (or directly by this process's own writes), plus a tombstone set of
//!   deleted ids.
//!
//! Before every search the index compares its cursors against the shared
//! state: a `base_version` bump in `beaver_collection_versions` forces a
//! full reload; otherwise any change-log rows past `last_seen_log_id` are
//! applied in order. Writes by the current process update the delta
//! immediately inside their own transaction, so no self-sync round-trip is
//! ever needed.
//!
//! Search is an exact squared-L2 scan over both tiers, excluding
//! tombstones and keeping the minimum distance for ids present in both.
//!
//! Compaction deletes the collection's change-log rows and bumps
//! `base_version`; every process in the fleet observes the bump and
//! reloads on its next operation. It must run under its own inter-process
//! lock (the collection manager provides it).

pub mod codec;

use std::collections::HashSet;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use beaver_core::{Error, Result};

pub use codec::{decode_vector, encode_vector};

/// Change-log operation: a vector insert.
pub const INSERT_OPERATION: i64 = 1;
/// Change-log operation: a vector delete.
pub const DELETE_OPERATION: i64 = 2;

#[derive(Default)]
struct IndexState {
    dimension: Option<usize>,
    base_vectors: Vec<Vec<f32>>,
    base_ids: Vec<String>,
    delta_vectors: Vec<Vec<f32>>,
    delta_ids: Vec<String>,
    tombstones: HashSet<String>,
    local_base_version: i64,
    last_seen_log_id: i64,
    initialized: bool,
}

impl IndexState {
    fn check_dimension(&mut self, collection: &str, vector: &[f32]) -> Result<()> {
        match self.dimension {
            None => {
                self.dimension = Some(vector.len());
                Ok(())
            }
            Some(expected) if expected == vector.len() => Ok(()),
            Some(expected) => {
                tracing::debug!(
                    collection,
                    expected,
                    got = vector.len(),
                    "vector dimension mismatch"
                );
                Err(Error::DimensionMismatch {
                    expected,
                    got: vector.len(),
                })
            }
        }
    }

    fn purge_from_delta(&mut self, item_id: &str) {
        while let Some(pos) = self.delta_ids.iter().position(|id| id == item_id) {
            self.delta_ids.remove(pos);
            self.delta_vectors.remove(pos);
        }
    }
}

/// Per-collection vector index. Thread-safe; shared by every handle to the
/// same collection within a process.
pub struct VectorIndex {
    collection: String,
    state: Mutex<IndexState>,
}

impl VectorIndex {
    /// Create an empty, uninitialized index for `collection`.
    pub fn new(collection: &str) -> Self {
        VectorIndex {
            collection: collection.to_string(),
            state: Mutex::new(IndexState {
                local_base_version: -1,
                last_seen_log_id: -1,
                ..IndexState::default()
            }),
        }
    }

    /// Vectors in the compacted base tier.
    pub fn base_size(&self) -> usize {
        self.state.lock().base_ids.len()
    }

    /// Vectors in the unmerged delta tier.
    pub fn delta_size(&self) -> usize {
        self.state.lock().delta_ids.len()
    }

    /// Log an insert and update this process's delta immediately.
    ///
    /// Must be called inside the collection's write transaction so the
    /// change-log row and the document row commit together.
    pub fn record_insert(&self, conn: &Connection, item_id: &str, vector: &[f32]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_dimension(&self.collection, vector)?;

        conn.execute(
            "INSERT INTO _vector_change_log (collection_name, item_id, operation_type)
             VALUES (?1, ?2, ?3)",
            params![self.collection, item_id, INSERT_OPERATION],
        )?;
        let log_id = conn.last_insert_rowid();

        // Fast path: apply our own write without a sync round-trip.
        state.purge_from_delta(item_id);
        state.delta_ids.push(item_id.to_string());
        state.delta_vectors.push(vector.to_vec());
        state.tombstones.remove(item_id);
        state.last_seen_log_id = log_id;
        Ok(())
    }

    /// Log a delete and update this process's tombstones immediately.
    pub fn record_delete(&self, conn: &Connection, item_id: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO _vector_change_log (collection_name, item_id, operation_type)
             VALUES (?1, ?2, ?3)",
            params![self.collection, item_id, DELETE_OPERATION],
        )?;
        let log_id = conn.last_insert_rowid();

        let mut state = self.state.lock();
        state.tombstones.insert(item_id.to_string());
        state.purge_from_delta(item_id);
        state.last_seen_log_id = log_id;
        Ok(())
    }

    fn shared_versions(&self, conn: &Connection) -> Result<(i64, i64)> {
        let base_version: Option<i64> = conn
            .query_row(
                "SELECT base_version FROM beaver_collection_versions WHERE collection_name = ?1",
                params![self.collection],
                |row| row.get(0),
            )
            .optional()?;

        let max_log_id: Option<i64> = conn.query_row(
            "SELECT MAX(log_id) FROM _vector_change_log WHERE collection_name = ?1",
            params![self.collection],
            |row| row.get(0),
        )?;

        Ok((base_version.unwrap_or(0), max_log_id.unwrap_or(0)))
    }

    /// Rebuild the base tier from the document table, keeping only ids
    /// whose latest change-log entry is not a DELETE.
    fn load_base(
        &self,
        state: &mut IndexState,
        conn: &Connection,
        base_version: i64,
        max_log_id: i64,
    ) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT c.item_id, c.item_vector
             FROM beaver_collections c
             WHERE c.collection = ?1 AND c.item_vector IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM _vector_change_log d
                   WHERE d.collection_name = ?1
                     AND d.item_id = c.item_id
                     AND d.operation_type = 2
                     AND d.log_id > COALESCE((
                         SELECT MAX(i.log_id) FROM _vector_change_log i
                         WHERE i.collection_name = ?1
                           AND i.item_id = c.item_id
                           AND i.operation_type = 1), 0)
               )",
        )?;
        let rows = stmt.query_map(params![self.collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        state.base_ids.clear();
        state.base_vectors.clear();
        for row in rows {
            let (item_id, bytes) = row?;
            let vector = decode_vector(&bytes)?;
            state.check_dimension(&self.collection, &vector)?;
            state.base_ids.push(item_id);
            state.base_vectors.push(vector);
        }

        state.delta_ids.clear();
        state.delta_vectors.clear();
        state.tombstones.clear();
        state.local_base_version = base_version;
        state.last_seen_log_id = max_log_id;
        state.initialized = true;

        tracing::debug!(
            collection = %self.collection,
            vectors = state.base_ids.len(),
            base_version,
            "vector base reloaded"
        );
        Ok(())
    }

    /// Apply change-log rows strictly after `last_seen_log_id`, in order.
    fn apply_deltas(
        &self,
        state: &mut IndexState,
        conn: &Connection,
        max_log_id: i64,
    ) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT l.log_id, l.item_id, l.operation_type, c.item_vector
             FROM _vector_change_log l
             LEFT JOIN beaver_collections c
               ON l.collection_name = c.collection AND l.item_id = c.item_id
             WHERE l.collection_name = ?1 AND l.log_id > ?2
             ORDER BY l.log_id ASC",
        )?;
        let rows = stmt.query_map(params![self.collection, state.last_seen_log_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?;

        for row in rows {
            let (_log_id, item_id, operation, bytes) = row?;
            match operation {
                INSERT_OPERATION => {
                    if let Some(bytes) = bytes {
                        let vector = decode_vector(&bytes)?;
                        state.check_dimension(&self.collection, &vector)?;
                        state.purge_from_delta(&item_id);
                        state.delta_ids.push(item_id.clone());
                        state.delta_vectors.push(vector);
                        state.tombstones.remove(&item_id);
                    }
                }
                DELETE_OPERATION => {
                    state.tombstones.insert(item_id.clone());
                    state.purge_from_delta(&item_id);
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown vector change-log operation {other}"
                    )));
                }
            }
        }

        state.last_seen_log_id = max_log_id;
        Ok(())
    }

    fn check_and_sync(&self, state: &mut IndexState, conn: &Connection) -> Result<()> {
        let (base_version, max_log_id) = self.shared_versions(conn)?;

        if state.initialized
            && state.local_base_version == base_version
            && state.last_seen_log_id >= max_log_id
        {
            return Ok(());
        }

        if !state.initialized || state.local_base_version < base_version {
            self.load_base(state, conn, base_version, max_log_id)
        } else {
            self.apply_deltas(state, conn, max_log_id)
        }
    }

    /// Force a sync against the shared state.
    pub fn refresh(&self, conn: &Connection) -> Result<()> {
        let mut state = self.state.lock();
        self.check_and_sync(&mut state, conn)
    }

    /// Drop all in-memory state so the next operation performs a full
    /// reload.
    pub fn mark_stale(&self) {
        let mut state = self.state.lock();
        *state = IndexState {
            local_base_version: -1,
            last_seen_log_id: -1,
            ..IndexState::default()
        };
    }

    /// Exact nearest-neighbor search by squared L2 distance.
    ///
    /// Syncs first, then scans base and delta, excluding tombstoned ids and
    /// keeping the minimum distance for ids present in both tiers. Returns
    /// up to `top_k` `(id, distance)` pairs, closest first.
    pub fn search(
        &self,
        conn: &Connection,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let mut state = self.state.lock();
        self.check_and_sync(&mut state, conn)?;

        if let Some(expected) = state.dimension {
            if expected != query.len() {
                return Err(Error::DimensionMismatch {
                    expected,
                    got: query.len(),
                });
            }
        }

        let mut best: std::collections::HashMap<&str, f32> = std::collections::HashMap::new();
        let tiers = [
            (&state.base_ids, &state.base_vectors),
            (&state.delta_ids, &state.delta_vectors),
        ];
        for (ids, vectors) in tiers {
            for (id, vector) in ids.iter().zip(vectors.iter()) {
                if state.tombstones.contains(id) {
                    continue;
                }
                let distance = squared_l2(query, vector);
                best.entry(id)
                    .and_modify(|d| *d = d.min(distance))
                    .or_insert(distance);
            }
        }

        let mut results: Vec<(String, f32)> = best
            .into_iter()
            .map(|(id, distance)| (id.to_string(), distance))
            .collect();
        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(top_k);
        Ok(results)
    }

    /// Rebuild the shared base: clear the change-log and bump
    /// `base_version` so every process reloads. Returns the new version.
    ///
    /// Callers must hold the collection's compaction lock.
    pub fn compact(&self, conn: &Connection) -> Result<i64> {
        let (base_version, _) = self.shared_versions(conn)?;

        conn.execute(
            "DELETE FROM _vector_change_log WHERE collection_name = ?1",
            params![self.collection],
        )?;

        let new_version = base_version + 1;
        conn.execute(
            "INSERT INTO beaver_collection_versions (collection_name, base_version)
             VALUES (?1, ?2)
             ON CONFLICT(collection_name) DO UPDATE SET base_version = excluded.base_version",
            params![self.collection, new_version],
        )?;

        // Our own next operation reloads too.
        self.mark_stale();
        tracing::debug!(collection = %self.collection, new_version, "vector index compacted");
        Ok(new_version)
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
