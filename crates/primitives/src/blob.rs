//! BlobManager: binary payloads with optional JSON metadata
//!
//! Payloads are raw bytes in a BLOB column; metadata is an optional JSON
//! document. Payloads are not cached (the coherent cache holds JSON
//! values), but existence and count checks are.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use beaver_concurrency::{CacheRegistry, LockGuard};
use beaver_core::{from_json, to_json, Error, Result};
use beaver_storage::Storage;

use crate::manager::ManagerCore;

/// A single blob retrieved from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    /// The blob's key within its store.
    pub key: String,
    /// The binary payload.
    pub data: Vec<u8>,
    /// Optional JSON metadata stored alongside the payload.
    pub metadata: Option<Value>,
}

impl Blob {
    /// Deserialize the metadata into a typed value.
    ///
    /// Fails with *key-absent*-style `None` handling left to the caller:
    /// returns `None` when no metadata was stored.
    pub fn metadata_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.metadata {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// A named blob store backed by `beaver_blobs`.
pub struct BlobManager {
    core: ManagerCore,
}

impl BlobManager {
    pub(crate) const KIND: &'static str = "blob";

    /// Create the manager for `name`.
    pub fn new(name: &str, storage: Arc<Storage>, caches: Arc<CacheRegistry>) -> Result<Self> {
        Ok(BlobManager {
            core: ManagerCore::new(Self::KIND, name, storage, caches)?,
        })
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Acquire the public lock for a batch of operations.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.core.lock_guard()
    }

    /// Store or replace a blob, with optional JSON-serializable metadata.
    pub fn put<M: Serialize>(&self, key: &str, data: &[u8], metadata: Option<&M>) -> Result<()> {
        let metadata_json = match metadata {
            Some(m) => Some(to_json(m)?),
            None => None,
        };
        self.core.mutate(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO beaver_blobs (store_name, key, data, metadata)
                 VALUES (?1, ?2, ?3, ?4)",
                params![self.core.name(), key, data, metadata_json],
            )?;
            Ok(())
        })
    }

    /// Retrieve a blob, or `None` when the key is absent.
    pub fn get(&self, key: &str) -> Result<Option<Blob>> {
        self.core.read(|conn| {
            let row: Option<(Vec<u8>, Option<String>)> = conn
                .query_row(
                    "SELECT data, metadata FROM beaver_blobs WHERE store_name = ?1 AND key = ?2",
                    params![self.core.name(), key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((data, metadata_json)) => {
                    let metadata = match metadata_json {
                        Some(raw) => Some(from_json(&raw)?),
                        None => None,
                    };
                    Ok(Some(Blob {
                        key: key.to_string(),
                        data,
                        metadata,
                    }))
                }
                None => Ok(None),
            }
        })
    }

    /// Retrieve a blob, failing with *key-absent* when missing.
    pub fn try_get(&self, key: &str) -> Result<Blob> {
        self.get(key)?.ok_or_else(|| Error::KeyNotFound {
            namespace: self.core.name().to_string(),
            key: key.to_string(),
        })
    }

    /// Delete a blob, failing with *key-absent* when missing.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.core.mutate(|tx| {
            let rows = tx.execute(
                "DELETE FROM beaver_blobs WHERE store_name = ?1 AND key = ?2",
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

    /// Whether `key` exists in the store.
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.core
            .cached_read(Some(format!("contains:{key}")), |conn| {
                let found: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM beaver_blobs WHERE store_name = ?1 AND key = ?2 LIMIT 1",
                        params![self.core.name(), key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
    }

    /// Number of blobs in the store.
    pub fn len(&self) -> Result<u64> {
        self.core.cached_read(Some("len".into()), |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM beaver_blobs WHERE store_name = ?1",
                params![self.core.name()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Whether the store has no blobs.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All keys in the store.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.core.cached_read(Some("keys".into()), |conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM beaver_blobs WHERE store_name = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![self.core.name()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }

    /// Serialize the whole store to a JSON object; payloads are
    /// base64-encoded.
    pub fn dump(&self) -> Result<Value> {
        let items = self.core.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, data, metadata FROM beaver_blobs WHERE store_name = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![self.core.name()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;

            let mut items = Vec::new();
            for row in rows {
                let (key, data, metadata_json) = row?;
                let metadata = match metadata_json {
                    Some(raw) => from_json::<Value>(&raw)?,
                    None => Value::Null,
                };
                items.push(json!({
                    "key": key,
                    "data": BASE64.encode(&data),
                    "metadata": metadata,
                }));
            }
            Ok(items)
        })?;

        Ok(json!({
            "metadata": {
                "type": "Blob",
                "name": self.core.name(),
                "count": items.len(),
            },
            "items": items,
        }))
    }
}
