//! Collection engine: documents, FTS, fuzzy search, vectors, and edges
//!
//! ## Design
//!
//! A collection aggregates five projections of one document set under a
//! common name: the row store, the FTS5 index, the trigram index, the
//! vector index, and the edge store. Every mutation fans out to all of them
//! inside a single write transaction together with the namespace version
//! bump, so readers on the same file never observe a partial document.
//!
//! Text matching has two modes. With `fuzziness == 0` the FTS5 `MATCH`
//! operator ranks candidates (lower rank is better). With `fuzziness > 0`
//! the query's trigrams are intersected with the trigram index and
//! candidates rank by shared-trigram count descending; since one edit
//! disturbs at most three trigrams, candidates must share at least
//! `|query trigrams| - 3 * fuzziness` of them, which bounds the edit
//! distance without computing it.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use beaver_concurrency::{BeaverLock, CacheRegistry, LockGuard, LockOptions};
use beaver_core::{from_json, to_json, Error, Result};
use beaver_storage::Storage;

use crate::document::{flatten_strings, trigrams, Document};
use crate::graph::{walk_sql, Direction};
use crate::vector::{decode_vector, encode_vector, VectorIndex};

/// Which flattened fields feed the FTS index on an upsert.
#[derive(Debug, Clone, Default)]
pub enum FtsMode {
    /// Index every string field.
    #[default]
    All,
    /// Index only the named field paths.
    Fields(Vec<String>),
    /// Skip full-text indexing.
    Off,
}

/// Options for [`CollectionManager::index`].
#[derive(Debug, Clone, Default)]
pub struct IndexRequest {
    /// Full-text selection.
    pub fts: FtsMode,
    /// Whether to maintain the trigram index for fuzzy matching.
    pub fuzzy: bool,
}

/// Options for [`CollectionManager::text_match`].
#[derive(Debug, Clone)]
pub struct MatchRequest {
    /// Restrict matching to these field paths.
    pub on: Option<Vec<String>>,
    /// Maximum number of documents returned.
    pub top_k: usize,
    /// 0 for exact FTS; above 0, the bound on allowed edit distance for
    /// trigram matching.
    pub fuzziness: u32,
}

impl Default for MatchRequest {
    fn default() -> Self {
        MatchRequest {
            on: None,
            top_k: 10,
            fuzziness: 0,
        }
    }
}

/// Manager base pattern shared with the primitive managers, carried here
/// separately so the search crate does not depend on the primitives crate.
struct CollectionCore {
    name: String,
    storage: Arc<Storage>,
    caches: Arc<CacheRegistry>,
    lock: BeaverLock,
}

/// A named document collection with multi-modal search.
pub struct CollectionManager {
    core: CollectionCore,
    vectors: VectorIndex,
}

impl CollectionManager {
    pub(crate) const KIND: &'static str = "collection";

    /// Create the manager for `name`.
    pub fn new(name: &str, storage: Arc<Storage>, caches: Arc<CacheRegistry>) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "collection name must be a non-empty string".into(),
            ));
        }
        let lock = BeaverLock::new(
            Arc::clone(&storage),
            &format!("__lock__{}__{name}", Self::KIND),
            LockOptions::default(),
        )?;
        Ok(CollectionManager {
            core: CollectionCore {
                name: name.to_string(),
                storage,
                caches,
                lock,
            },
            vectors: VectorIndex::new(name),
        })
    }

    /// The collection's name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The vector index behind this collection.
    pub fn vector_index(&self) -> &VectorIndex {
        &self.vectors
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.core.storage
    }

    /// Start a fluent query over this collection.
    pub fn query(&self) -> crate::query::DocumentQuery<'_> {
        crate::query::DocumentQuery::new(self)
    }

    /// Acquire the public lock for a batch of operations.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.core.lock.guard()
    }

    fn namespace(&self) -> String {
        format!("{}:{}", Self::KIND, self.core.name)
    }

    /// Run a mutation in one transaction with the version bump, then apply
    /// the invalidates-write contract to the calling thread's cache.
    fn mutate<R>(&self, op: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let result = self.core.storage.with_txn(|tx| {
            let value = op(tx)?;
            let version = beaver_storage::registry::bump(tx, &self.namespace())?;
            Ok((value, version))
        });

        let cache = self.core.caches.cache(&self.namespace());
        cache.invalidate();

        match result {
            Ok((value, version)) => {
                cache.sync(version);
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Insert or update a document, refreshing every projection.
    pub fn index(&self, document: &Document, request: &IndexRequest) -> Result<()> {
        let fields = flatten_strings(&document.metadata);
        let metadata_json = to_json(&document.metadata)?;
        let vector_bytes = document.embedding.as_deref().map(encode_vector);

        self.mutate(|tx| {
            tx.execute(
                "DELETE FROM beaver_fts_index WHERE collection = ?1 AND item_id = ?2",
                params![self.core.name, document.id],
            )?;

            let selected: Vec<&(String, String)> = match &request.fts {
                FtsMode::All => fields.iter().collect(),
                FtsMode::Fields(names) => fields
                    .iter()
                    .filter(|(path, _)| names.contains(path))
                    .collect(),
                FtsMode::Off => Vec::new(),
            };
            for (path, content) in &selected {
                tx.execute(
                    "INSERT INTO beaver_fts_index (collection, item_id, field_path, field_content)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![self.core.name, document.id, path, content],
                )?;
            }

            tx.execute(
                "DELETE FROM beaver_trigrams WHERE collection = ?1 AND item_id = ?2",
                params![self.core.name, document.id],
            )?;
            if request.fuzzy {
                for (path, content) in &fields {
                    for gram in trigrams(content) {
                        tx.execute(
                            "INSERT OR IGNORE INTO beaver_trigrams
                             (collection, item_id, field_path, trigram)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![self.core.name, document.id, path, gram],
                        )?;
                    }
                }
            }

            tx.execute(
                "INSERT OR REPLACE INTO beaver_collections (collection, item_id, item_vector, metadata)
                 VALUES (?1, ?2, ?3, ?4)",
                params![self.core.name, document.id, vector_bytes, metadata_json],
            )?;

            if let Some(embedding) = &document.embedding {
                self.vectors.record_insert(tx, &document.id, embedding)?;
            }
            Ok(())
        })
    }

    /// Remove a document and everything derived from it: row, FTS rows,
    /// trigrams, all touching edges, plus a DELETE change-log entry.
    pub fn remove(&self, item_id: &str) -> Result<()> {
        self.mutate(|tx| {
            tx.execute(
                "DELETE FROM beaver_collections WHERE collection = ?1 AND item_id = ?2",
                params![self.core.name, item_id],
            )?;
            tx.execute(
                "DELETE FROM beaver_fts_index WHERE collection = ?1 AND item_id = ?2",
                params![self.core.name, item_id],
            )?;
            tx.execute(
                "DELETE FROM beaver_trigrams WHERE collection = ?1 AND item_id = ?2",
                params![self.core.name, item_id],
            )?;
            tx.execute(
                "DELETE FROM beaver_edges
                 WHERE collection = ?1 AND (source_item_id = ?2 OR target_item_id = ?2)",
                params![self.core.name, item_id],
            )?;
            self.vectors.record_delete(tx, item_id)?;
            Ok(())
        })
    }

    fn document_from_row(
        item_id: String,
        vector_bytes: Option<Vec<u8>>,
        metadata_json: String,
    ) -> Result<Document> {
        let embedding = match vector_bytes {
            Some(bytes) => Some(decode_vector(&bytes)?),
            None => None,
        };
        Ok(Document {
            id: item_id,
            embedding,
            metadata: from_json(&metadata_json)?,
        })
    }

    /// Fetch a document by id.
    pub fn get(&self, item_id: &str) -> Result<Option<Document>> {
        self.core.storage.with_conn(|conn| {
            let row: Option<(Option<Vec<u8>>, String)> = conn
                .query_row(
                    "SELECT item_vector, metadata FROM beaver_collections
                     WHERE collection = ?1 AND item_id = ?2",
                    params![self.core.name, item_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((bytes, metadata)) => {
                    Ok(Some(Self::document_from_row(item_id.to_string(), bytes, metadata)?))
                }
                None => Ok(None),
            }
        })
    }

    /// Fetch several documents, preserving the order of `ids`. Missing ids
    /// are silently skipped.
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.core.storage.with_conn(|conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!(
                "SELECT item_id, item_vector, metadata FROM beaver_collections
                 WHERE collection = ?1 AND item_id IN ({placeholders})"
            );

            let mut stmt = conn.prepare(&sql)?;
            let mut sql_params: Vec<&dyn rusqlite::ToSql> = vec![&self.core.name];
            for id in ids {
                sql_params.push(id);
            }
            let rows = stmt.query_map(&sql_params[..], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut by_id = std::collections::HashMap::new();
            for row in rows {
                let (item_id, bytes, metadata) = row?;
                let doc = Self::document_from_row(item_id.clone(), bytes, metadata)?;
                by_id.insert(item_id, doc);
            }

            Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
        })
    }

    /// Every document in the collection.
    pub fn documents(&self) -> Result<Vec<Document>> {
        self.core.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, item_vector, metadata FROM beaver_collections
                 WHERE collection = ?1",
            )?;
            let rows = stmt.query_map(params![self.core.name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut docs = Vec::new();
            for row in rows {
                let (item_id, bytes, metadata) = row?;
                docs.push(Self::document_from_row(item_id, bytes, metadata)?);
            }
            Ok(docs)
        })
    }

    /// Number of documents.
    pub fn count(&self) -> Result<u64> {
        self.core.storage.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM beaver_collections WHERE collection = ?1",
                params![self.core.name],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Remove every document, projection, and change-log row, bumping the
    /// base version so every process's vector index reloads empty.
    pub fn clear(&self) -> Result<()> {
        self.mutate(|tx| {
            for sql in [
                "DELETE FROM beaver_collections WHERE collection = ?1",
                "DELETE FROM beaver_fts_index WHERE collection = ?1",
                "DELETE FROM beaver_trigrams WHERE collection = ?1",
                "DELETE FROM beaver_edges WHERE collection = ?1",
            ] {
                tx.execute(sql, params![self.core.name])?;
            }
            self.vectors.compact(tx)?;
            Ok(())
        })
    }

    /// Full-text or fuzzy match over indexed fields.
    ///
    /// Returns `(document, score)` pairs. With `fuzziness == 0` the score
    /// is the FTS rank (lower is better); otherwise it is the shared
    /// trigram count (higher is better).
    pub fn text_match(&self, query: &str, request: &MatchRequest) -> Result<Vec<(Document, f64)>> {
        if request.fuzziness == 0 {
            self.fts_match(query, request)
        } else {
            self.fuzzy_match(query, request)
        }
    }

    fn fts_match(&self, query: &str, request: &MatchRequest) -> Result<Vec<(Document, f64)>> {
        self.core.storage.with_conn(|conn| {
            let mut field_filter = String::new();
            if let Some(on) = &request.on {
                let placeholders = vec!["?"; on.len()].join(",");
                field_filter = format!("AND field_path IN ({placeholders})");
            }
            let sql = format!(
                "SELECT t1.item_id, t1.item_vector, t1.metadata, fts.rank
                 FROM beaver_collections AS t1 JOIN (
                     SELECT item_id, MIN(rank) AS rank FROM beaver_fts_index
                     WHERE beaver_fts_index MATCH ? AND collection = ? {field_filter}
                     GROUP BY item_id ORDER BY rank LIMIT ?
                 ) AS fts ON t1.item_id = fts.item_id
                 WHERE t1.collection = ?
                 ORDER BY fts.rank"
            );

            let top_k = request.top_k as i64;
            let mut sql_params: Vec<&dyn rusqlite::ToSql> = vec![&query, &self.core.name];
            if let Some(on) = &request.on {
                for field in on {
                    sql_params.push(field);
                }
            }
            sql_params.push(&top_k);
            sql_params.push(&self.core.name);

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&sql_params[..], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?;

            let mut results = Vec::new();
            for row in rows {
                let (item_id, bytes, metadata, rank) = row?;
                results.push((Self::document_from_row(item_id, bytes, metadata)?, rank));
            }
            Ok(results)
        })
    }

    fn fuzzy_match(&self, query: &str, request: &MatchRequest) -> Result<Vec<(Document, f64)>> {
        let query_grams = trigrams(query);
        if query_grams.is_empty() {
            return Ok(Vec::new());
        }

        // One edit disturbs at most three trigrams, so any candidate within
        // the allowed edit distance shares at least this many.
        let threshold = (query_grams.len() as i64 - 3 * request.fuzziness as i64).max(1);

        let scored: Vec<(String, f64)> = self.core.storage.with_conn(|conn| {
            let gram_placeholders = vec!["?"; query_grams.len()].join(",");
            let mut field_filter = String::new();
            if let Some(on) = &request.on {
                let placeholders = vec!["?"; on.len()].join(",");
                field_filter = format!("AND field_path IN ({placeholders})");
            }
            let sql = format!(
                "SELECT item_id, COUNT(DISTINCT trigram) AS matches
                 FROM beaver_trigrams
                 WHERE collection = ? AND trigram IN ({gram_placeholders}) {field_filter}
                 GROUP BY item_id
                 HAVING matches >= ?
                 ORDER BY matches DESC, item_id ASC
                 LIMIT ?"
            );

            let threshold_param = threshold;
            let top_k = request.top_k as i64;
            let mut sql_params: Vec<&dyn rusqlite::ToSql> = vec![&self.core.name];
            for gram in &query_grams {
                sql_params.push(gram);
            }
            if let Some(on) = &request.on {
                for field in on {
                    sql_params.push(field);
                }
            }
            sql_params.push(&threshold_param);
            sql_params.push(&top_k);

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&sql_params[..], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as f64))
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })?;

        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let docs = self.get_many(&ids)?;
        let scores: std::collections::HashMap<String, f64> = scored.into_iter().collect();

        Ok(docs
            .into_iter()
            .map(|doc| {
                let score = scores.get(&doc.id).copied().unwrap_or(0.0);
                (doc, score)
            })
            .collect())
    }

    /// Exact nearest-neighbor search over indexed embeddings.
    pub fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<(Document, f64)>> {
        let hits = self
            .core
            .storage
            .with_conn(|conn| self.vectors.search(conn, vector, top_k))?;

        let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
        let docs = self.get_many(&ids)?;
        let distances: std::collections::HashMap<String, f32> = hits.into_iter().collect();

        Ok(docs
            .into_iter()
            .map(|doc| {
                let distance = distances.get(&doc.id).copied().unwrap_or(f32::MAX);
                (doc, f64::from(distance))
            })
            .collect())
    }

    /// Create or update a directed labeled edge between two documents.
    pub fn connect(
        &self,
        source_id: &str,
        target_id: &str,
        label: &str,
        metadata: Option<&Value>,
    ) -> Result<()> {
        let metadata_json = match metadata {
            Some(value) => Some(to_json(value)?),
            None => None,
        };
        self.mutate(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO beaver_edges
                 (collection, source_item_id, target_item_id, label, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![self.core.name, source_id, target_id, label, metadata_json],
            )?;
            Ok(())
        })
    }

    /// Remove a directed edge.
    pub fn disconnect(&self, source_id: &str, target_id: &str, label: &str) -> Result<()> {
        self.mutate(|tx| {
            tx.execute(
                "DELETE FROM beaver_edges
                 WHERE collection = ?1 AND source_item_id = ?2
                   AND target_item_id = ?3 AND label = ?4",
                params![self.core.name, source_id, target_id, label],
            )?;
            Ok(())
        })
    }

    /// Whether a specific edge exists.
    pub fn connected(&self, source_id: &str, target_id: &str, label: &str) -> Result<bool> {
        self.core.storage.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM beaver_edges
                     WHERE collection = ?1 AND source_item_id = ?2
                       AND target_item_id = ?3 AND label = ?4
                     LIMIT 1",
                    params![self.core.name, source_id, target_id, label],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// One-hop outgoing neighbors, optionally filtered by label.
    pub fn neighbors(&self, item_id: &str, label: Option<&str>) -> Result<Vec<Document>> {
        self.core.storage.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT t1.item_id, t1.item_vector, t1.metadata
                 FROM beaver_collections AS t1
                 JOIN beaver_edges AS t2
                   ON t1.item_id = t2.target_item_id AND t1.collection = t2.collection
                 WHERE t2.collection = ?1 AND t2.source_item_id = ?2",
            );
            let mut sql_params: Vec<&dyn rusqlite::ToSql> = vec![&self.core.name, &item_id];
            if let Some(label) = &label {
                sql.push_str(" AND t2.label = ?3");
                sql_params.push(label);
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&sql_params[..], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut docs = Vec::new();
            for row in rows {
                let (id, bytes, metadata) = row?;
                docs.push(Self::document_from_row(id, bytes, metadata)?);
            }
            Ok(docs)
        })
    }

    /// Breadth-first traversal from `source_id` along edges whose label is
    /// in `labels`, up to `depth` hops. Returns the distinct reachable
    /// documents, excluding the source itself.
    pub fn walk(
        &self,
        source_id: &str,
        labels: &[&str],
        depth: u32,
        direction: Direction,
    ) -> Result<Vec<Document>> {
        if depth == 0 || labels.is_empty() {
            return Ok(Vec::new());
        }

        self.core.storage.with_conn(|conn| {
            let sql = walk_sql(direction, labels.len());
            let depth_param = depth as i64;

            let mut sql_params: Vec<&dyn rusqlite::ToSql> =
                vec![&source_id, &self.core.name, &depth_param];
            for label in labels {
                sql_params.push(label);
            }
            sql_params.push(&self.core.name);

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&sql_params[..], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut docs = Vec::new();
            for row in rows {
                let (id, bytes, metadata) = row?;
                if id == source_id {
                    continue;
                }
                docs.push(Self::document_from_row(id, bytes, metadata)?);
            }
            Ok(docs)
        })
    }

    /// Rebuild the vector base under the collection's compaction lock.
    pub fn compact(&self) -> Result<()> {
        let compaction_lock = BeaverLock::new(
            Arc::clone(&self.core.storage),
            &format!("__lock__compact__{}", self.core.name),
            LockOptions::default(),
        )?;
        let _guard = compaction_lock.guard()?;

        self.mutate(|tx| {
            self.vectors.compact(tx)?;
            Ok(())
        })
    }

    /// Serialize the whole collection to a JSON object.
    pub fn dump(&self) -> Result<Value> {
        let docs = self.documents()?;
        let items: Vec<Value> = docs
            .iter()
            .map(|doc| {
                json!({
                    "id": doc.id,
                    "embedding": doc.embedding,
                    "metadata": doc.metadata,
                })
            })
            .collect();
        Ok(json!({
            "metadata": {
                "type": "Collection",
                "name": self.core.name,
                "count": items.len(),
            },
            "items": items,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beaver_storage::OpenOptions;
    use tempfile::TempDir;

    fn open_collection(name: &str) -> (TempDir, Arc<Storage>, CollectionManager) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coll.db");
        let storage = Storage::open(path.to_str().unwrap(), OpenOptions::default()).unwrap();
        let caches = Arc::new(CacheRegistry::new(
            Arc::clone(&storage),
            true,
            CacheRegistry::DEFAULT_CHECK_INTERVAL,
        ));
        let collection = CollectionManager::new(name, Arc::clone(&storage), caches).unwrap();
        (dir, storage, collection)
    }

    fn article(id: &str, title: &str) -> Document {
        Document::new(json!({"title": title})).with_id(id)
    }

    #[test]
    fn index_then_get_round_trip() {
        let (_dir, _storage, coll) = open_collection("articles");
        let doc = article("a1", "hello world").with_embedding(vec![0.5, 0.5]);
        coll.index(&doc, &IndexRequest::default()).unwrap();

        let back = coll.get("a1").unwrap().unwrap();
        assert_eq!(back.metadata["title"], "hello world");
        assert_eq!(back.embedding, Some(vec![0.5, 0.5]));
        assert_eq!(coll.count().unwrap(), 1);
    }

    #[test]
    fn upsert_replaces_every_projection() {
        let (_dir, storage, coll) = open_collection("articles");
        coll.index(
            &article("a1", "original phrase"),
            &IndexRequest {
                fts: FtsMode::All,
                fuzzy: true,
            },
        )
        .unwrap();
        coll.index(
            &article("a1", "replacement words"),
            &IndexRequest {
                fts: FtsMode::All,
                fuzzy: true,
            },
        )
        .unwrap();

        // Old FTS content no longer matches.
        let old = coll.text_match("original", &MatchRequest::default()).unwrap();
        assert!(old.is_empty());
        let new = coll
            .text_match("replacement", &MatchRequest::default())
            .unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].0.id, "a1");

        // Exactly one row per projection.
        let fts_rows: i64 = storage
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM beaver_collections WHERE collection = 'articles'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(fts_rows, 1);
    }

    #[test]
    fn fts_match_ranks_and_respects_field_filter() {
        let (_dir, _storage, coll) = open_collection("articles");
        coll.index(
            &Document::new(json!({"title": "rust database", "body": "nothing"})).with_id("t"),
            &IndexRequest::default(),
        )
        .unwrap();
        coll.index(
            &Document::new(json!({"title": "cooking", "body": "rust removal tips"})).with_id("b"),
            &IndexRequest::default(),
        )
        .unwrap();

        let all = coll.text_match("rust", &MatchRequest::default()).unwrap();
        assert_eq!(all.len(), 2);

        let title_only = coll
            .text_match(
                "rust",
                &MatchRequest {
                    on: Some(vec!["title".into()]),
                    ..MatchRequest::default()
                },
            )
            .unwrap();
        assert_eq!(title_only.len(), 1);
        assert_eq!(title_only[0].0.id, "t");
    }

    #[test]
    fn fuzzy_match_tolerates_typos() {
        let (_dir, _storage, coll) = open_collection("articles");
        coll.index(
            &article("py", "python is great"),
            &IndexRequest {
                fts: FtsMode::All,
                fuzzy: true,
            },
        )
        .unwrap();

        let hits = coll
            .text_match(
                "pythn",
                &MatchRequest {
                    fuzziness: 2,
                    ..MatchRequest::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "py");
        assert!(hits[0].1 >= 1.0);

        // Gibberish shares no trigrams.
        let none = coll
            .text_match(
                "zzqqk",
                &MatchRequest {
                    fuzziness: 1,
                    ..MatchRequest::default()
                },
            )
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn vector_search_round_trip() {
        let (_dir, _storage, coll) = open_collection("vectors");
        coll.index(
            &article("x", "python is great").with_embedding(vec![0.1, 0.9]),
            &IndexRequest::default(),
        )
        .unwrap();

        let hits = coll.search(&[0.1, 0.9], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "x");
        assert_eq!(hits[0].1, 0.0);
    }

    #[test]
    fn remove_clears_every_projection() {
        let (_dir, storage, coll) = open_collection("articles");
        coll.index(
            &article("x", "python is great").with_embedding(vec![0.1, 0.9]),
            &IndexRequest {
                fts: FtsMode::All,
                fuzzy: true,
            },
        )
        .unwrap();
        coll.connect("x", "y", "REL", None).unwrap();

        coll.remove("x").unwrap();

        assert!(coll.get("x").unwrap().is_none());
        assert!(coll
            .text_match("python", &MatchRequest::default())
            .unwrap()
            .is_empty());
        assert!(coll
            .text_match(
                "pythn",
                &MatchRequest {
                    fuzziness: 2,
                    ..MatchRequest::default()
                }
            )
            .unwrap()
            .is_empty());
        assert!(coll.search(&[0.1, 0.9], 1).unwrap().is_empty());

        let edges: i64 = storage
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM beaver_edges WHERE collection = 'articles'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(edges, 0);
    }

    #[test]
    fn failed_index_leaves_no_trace() {
        let (_dir, _storage, coll) = open_collection("articles");
        coll.index(
            &article("a", "seed").with_embedding(vec![1.0, 2.0]),
            &IndexRequest::default(),
        )
        .unwrap();

        // Wrong dimension: the whole fan-out rolls back.
        let bad = article("b", "bad vector").with_embedding(vec![1.0]);
        let err = coll.index(&bad, &IndexRequest::default()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));

        assert!(coll.get("b").unwrap().is_none());
        assert!(coll
            .text_match("bad", &MatchRequest::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn neighbors_and_walk() {
        let (_dir, _storage, coll) = open_collection("social");
        for id in ["alice", "bob", "charlie", "diana"] {
            coll.index(&article(id, id), &IndexRequest::default())
                .unwrap();
        }
        coll.connect("alice", "bob", "FOLLOWS", None).unwrap();
        coll.connect("alice", "charlie", "FOLLOWS", None).unwrap();
        coll.connect("bob", "diana", "FOLLOWS", None).unwrap();
        coll.connect("alice", "diana", "BLOCKS", None).unwrap();

        let direct = coll.neighbors("alice", Some("FOLLOWS")).unwrap();
        let mut names: Vec<&str> = direct.iter().map(|d| d.id.as_str()).collect();
        names.sort();
        assert_eq!(names, ["bob", "charlie"]);

        let reachable = coll
            .walk("alice", &["FOLLOWS"], 2, Direction::Outgoing)
            .unwrap();
        let mut names: Vec<&str> = reachable.iter().map(|d| d.id.as_str()).collect();
        names.sort();
        assert_eq!(names, ["bob", "charlie", "diana"]);

        // Depth 1 stops before diana.
        let one_hop = coll
            .walk("alice", &["FOLLOWS"], 1, Direction::Outgoing)
            .unwrap();
        assert_eq!(one_hop.len(), 2);

        // Incoming walk from diana finds her followers' chain.
        let upstream = coll
            .walk("diana", &["FOLLOWS"], 2, Direction::Incoming)
            .unwrap();
        let mut names: Vec<&str> = upstream.iter().map(|d| d.id.as_str()).collect();
        names.sort();
        assert_eq!(names, ["alice", "bob"]);
    }

    #[test]
    fn disconnect_and_connected() {
        let (_dir, _storage, coll) = open_collection("social");
        coll.index(&article("a", "a"), &IndexRequest::default())
            .unwrap();
        coll.index(&article("b", "b"), &IndexRequest::default())
            .unwrap();

        coll.connect("a", "b", "REL", Some(&json!({"since": 2020})))
            .unwrap();
        assert!(coll.connected("a", "b", "REL").unwrap());

        coll.disconnect("a", "b", "REL").unwrap();
        assert!(!coll.connected("a", "b", "REL").unwrap());
    }

    #[test]
    fn clear_resets_the_collection() {
        let (_dir, _storage, coll) = open_collection("articles");
        coll.index(
            &article("a", "text").with_embedding(vec![1.0]),
            &IndexRequest {
                fts: FtsMode::All,
                fuzzy: true,
            },
        )
        .unwrap();
        coll.connect("a", "a", "SELF", None).unwrap();

        coll.clear().unwrap();

        assert_eq!(coll.count().unwrap(), 0);
        assert!(coll.search(&[1.0], 1).unwrap().is_empty());
        assert!(coll.documents().unwrap().is_empty());
    }

    #[test]
    fn fts_mode_fields_limits_indexing() {
        let (_dir, _storage, coll) = open_collection("articles");
        coll.index(
            &Document::new(json!({"title": "indexed words", "body": "hidden words"}))
                .with_id("a"),
            &IndexRequest {
                fts: FtsMode::Fields(vec!["title".into()]),
                fuzzy: false,
            },
        )
        .unwrap();

        assert!(!coll
            .text_match("indexed", &MatchRequest::default())
            .unwrap()
            .is_empty());
        assert!(coll
            .text_match("hidden", &MatchRequest::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn fts_mode_off_skips_indexing() {
        let (_dir, _storage, coll) = open_collection("articles");
        coll.index(
            &article("a", "invisible"),
            &IndexRequest {
                fts: FtsMode::Off,
                fuzzy: false,
            },
        )
        .unwrap();
        assert!(coll
            .text_match("invisible", &MatchRequest::default())
            .unwrap()
            .is_empty());
        // The document itself is still stored.
        assert!(coll.get("a").unwrap().is_some());
    }

    #[test]
    fn compact_keeps_search_results() {
        let (_dir, _storage, coll) = open_collection("vectors");
        coll.index(
            &article("a", "a").with_embedding(vec![1.0, 0.0]),
            &IndexRequest::default(),
        )
        .unwrap();
        coll.index(
            &article("b", "b").with_embedding(vec![0.0, 1.0]),
            &IndexRequest::default(),
        )
        .unwrap();
        coll.remove("b").unwrap();

        coll.compact().unwrap();

        let hits = coll.search(&[1.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "a");
        // Post-compaction everything lives in the base tier.
        assert_eq!(coll.vector_index().base_size(), 1);
        assert_eq!(coll.vector_index().delta_size(), 0);
    }
}
