//! ListManager: an ordered list with O(1) positional inserts
//!
//! Items carry a REAL `item_order` column. Appending uses `max + 1`,
//! prepending `min - 1`, and inserting between neighbors the midpoint
//! `(a + b) / 2`, so no insert ever rewrites other rows. Long chains of
//! midpoint inserts can exhaust f64 precision; renumbering is a caller
//! concern.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use beaver_concurrency::{CacheRegistry, LockGuard};
use beaver_core::{from_json, to_json, Error, Result};
use beaver_storage::Storage;

use crate::manager::ManagerCore;

/// A named ordered list stored in `beaver_lists`.
pub struct ListManager {
    core: ManagerCore,
}

impl ListManager {
    pub(crate) const KIND: &'static str = "list";

    /// Create the manager for `name`.
    pub fn new(name: &str, storage: Arc<Storage>, caches: Arc<CacheRegistry>) -> Result<Self> {
        Ok(ListManager {
            core: ManagerCore::new(Self::KIND, name, storage, caches)?,
        })
    }

    /// The list's name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Acquire the public lock for a batch of operations.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.core.lock_guard()
    }

    fn len_on(&self, conn: &Connection) -> Result<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM beaver_lists WHERE list_name = ?1",
            params![self.core.name()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Resolve a possibly-negative index against `len`, or fail with
    /// *index-out-of-range*.
    fn resolve_index(&self, index: i64, len: usize) -> Result<usize> {
        let len_i = len as i64;
        let offset = if index < 0 { len_i + index } else { index };
        if offset < 0 || offset >= len_i {
            return Err(Error::IndexOutOfRange { index, len });
        }
        Ok(offset as usize)
    }

    fn order_at(&self, conn: &Connection, offset: usize) -> Result<f64> {
        let order: Option<f64> = conn
            .query_row(
                "SELECT item_order FROM beaver_lists WHERE list_name = ?1
                 ORDER BY item_order ASC LIMIT 1 OFFSET ?2",
                params![self.core.name(), offset as i64],
                |row| row.get(0),
            )
            .optional()?;
        order.ok_or(Error::IndexOutOfRange {
            index: offset as i64,
            len: 0,
        })
    }

    /// Append to the end of the list.
    pub fn push<T: Serialize>(&self, value: &T) -> Result<()> {
        let raw = to_json(value)?;
        self.core.mutate(|tx| {
            let max: Option<f64> = tx.query_row(
                "SELECT MAX(item_order) FROM beaver_lists WHERE list_name = ?1",
                params![self.core.name()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO beaver_lists (list_name, item_order, item_value) VALUES (?1, ?2, ?3)",
                params![self.core.name(), max.unwrap_or(0.0) + 1.0, raw],
            )?;
            Ok(())
        })
    }

    /// Insert at the front of the list.
    pub fn prepend<T: Serialize>(&self, value: &T) -> Result<()> {
        let raw = to_json(value)?;
        self.core.mutate(|tx| {
            let min: Option<f64> = tx.query_row(
                "SELECT MIN(item_order) FROM beaver_lists WHERE list_name = ?1",
                params![self.core.name()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO beaver_lists (list_name, item_order, item_value) VALUES (?1, ?2, ?3)",
                params![self.core.name(), min.unwrap_or(0.0) - 1.0, raw],
            )?;
            Ok(())
        })
    }

    /// Insert at position `index`. `index <= 0` prepends, `index >= len`
    /// appends, anything else lands between its neighbors at the midpoint
    /// order.
    pub fn insert<T: Serialize>(&self, index: i64, value: &T) -> Result<()> {
        let raw = to_json(value)?;
        self.core.mutate(|tx| {
            let len = self.len_on(tx)?;

            let order = if index <= 0 {
                let min: Option<f64> = tx.query_row(
                    "SELECT MIN(item_order) FROM beaver_lists WHERE list_name = ?1",
                    params![self.core.name()],
                    |row| row.get(0),
                )?;
                min.unwrap_or(0.0) - 1.0
            } else if index as usize >= len {
                let max: Option<f64> = tx.query_row(
                    "SELECT MAX(item_order) FROM beaver_lists WHERE list_name = ?1",
                    params![self.core.name()],
                    |row| row.get(0),
                )?;
                max.unwrap_or(0.0) + 1.0
            } else {
                let before = self.order_at(tx, index as usize - 1)?;
                let after = self.order_at(tx, index as usize)?;
                before + (after - before) / 2.0
            };

            tx.execute(
                "INSERT INTO beaver_lists (list_name, item_order, item_value) VALUES (?1, ?2, ?3)",
                params![self.core.name(), order, raw],
            )?;
            Ok(())
        })
    }

    /// Item at `index`; negative indices count from the end.
    pub fn get<T: DeserializeOwned>(&self, index: i64) -> Result<T> {
        // Positional reads are not cached: any concurrent insert shifts
        // offsets, and the version check window would serve the wrong slot.
        self.core.read(|conn| {
            let len = self.len_on(conn)?;
            let offset = self.resolve_index(index, len)?;
            let raw: String = conn.query_row(
                "SELECT item_value FROM beaver_lists WHERE list_name = ?1
                 ORDER BY item_order ASC LIMIT 1 OFFSET ?2",
                params![self.core.name(), offset as i64],
                |row| row.get(0),
            )?;
            from_json(&raw)
        })
    }

    /// Replace the item at `index`.
    pub fn set<T: Serialize>(&self, index: i64, value: &T) -> Result<()> {
        let raw = to_json(value)?;
        self.core.mutate(|tx| {
            let len = self.len_on(tx)?;
            let offset = self.resolve_index(index, len)?;
            let order = self.order_at(tx, offset)?;
            tx.execute(
                "UPDATE beaver_lists SET item_value = ?1 WHERE list_name = ?2 AND item_order = ?3",
                params![raw, self.core.name(), order],
            )?;
            Ok(())
        })
    }

    /// Delete the item at `index`.
    pub fn remove(&self, index: i64) -> Result<()> {
        self.core.mutate(|tx| {
            let len = self.len_on(tx)?;
            let offset = self.resolve_index(index, len)?;
            let order = self.order_at(tx, offset)?;
            tx.execute(
                "DELETE FROM beaver_lists WHERE list_name = ?1 AND item_order = ?2",
                params![self.core.name(), order],
            )?;
            Ok(())
        })
    }

    /// Remove and return the last item, or `None` on an empty list.
    pub fn pop<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.take_end(false)
    }

    /// Remove and return the first item, or `None` on an empty list.
    pub fn deque<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.take_end(true)
    }

    fn take_end<T: DeserializeOwned>(&self, front: bool) -> Result<Option<T>> {
        let direction = if front { "ASC" } else { "DESC" };
        self.core.mutate(|tx| {
            let row: Option<(f64, String)> = tx
                .query_row(
                    &format!(
                        "SELECT item_order, item_value FROM beaver_lists
                         WHERE list_name = ?1 ORDER BY item_order {direction} LIMIT 1"
                    ),
                    params![self.core.name()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((order, raw)) = row else {
                return Ok(None);
            };
            tx.execute(
                "DELETE FROM beaver_lists WHERE list_name = ?1 AND item_order = ?2",
                params![self.core.name(), order],
            )?;
            Ok(Some(from_json(&raw)?))
        })
    }

    /// Slice `[start, end)` with Python-style negative/None bounds.
    ///
    /// Only `step == 1` is supported; anything else is *invalid-argument*.
    pub fn slice<T: DeserializeOwned>(
        &self,
        start: Option<i64>,
        end: Option<i64>,
        step: i64,
    ) -> Result<Vec<T>> {
        if step != 1 {
            return Err(Error::InvalidArgument(
                "slicing with a step is not supported".into(),
            ));
        }

        self.core.read(|conn| {
            let len = self.len_on(conn)? as i64;
            let clamp = |bound: i64| -> i64 {
                let resolved = if bound < 0 { len + bound } else { bound };
                resolved.clamp(0, len)
            };
            let start = clamp(start.unwrap_or(0));
            let end = clamp(end.unwrap_or(len));
            let limit = end - start;
            if limit <= 0 {
                return Ok(Vec::new());
            }

            let mut stmt = conn.prepare(
                "SELECT item_value FROM beaver_lists WHERE list_name = ?1
                 ORDER BY item_order ASC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![self.core.name(), limit, start], |row| {
                row.get::<_, String>(0)
            })?;

            let mut items = Vec::new();
            for raw in rows {
                items.push(from_json(&raw?)?);
            }
            Ok(items)
        })
    }

    /// Whether `value` is present in the list.
    pub fn contains<T: Serialize>(&self, value: &T) -> Result<bool> {
        let raw = to_json(value)?;
        self.core.read(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM beaver_lists WHERE list_name = ?1 AND item_value = ?2 LIMIT 1",
                    params![self.core.name(), raw],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// All items in order.
    pub fn iter<T: DeserializeOwned>(&self) -> Result<std::vec::IntoIter<T>> {
        Ok(self.slice::<T>(None, None, 1)?.into_iter())
    }

    /// Number of items.
    pub fn len(&self) -> Result<u64> {
        self.core.cached_read(Some("len".into()), |conn| {
            Ok(self.len_on(conn)? as u64)
        })
    }

    /// Whether the list has no items.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every item.
    pub fn clear(&self) -> Result<()> {
        self.core.mutate(|tx| {
            tx.execute(
                "DELETE FROM beaver_lists WHERE list_name = ?1",
                params![self.core.name()],
            )?;
            Ok(())
        })
    }

    /// Serialize the whole list to a JSON object.
    pub fn dump(&self) -> Result<Value> {
        let items = self.slice::<Value>(None, None, 1)?;
        Ok(json!({
            "metadata": {
                "type": "List",
                "name": self.core.name(),
                "count": items.len(),
            },
            "items": items,
        }))
    }
}
