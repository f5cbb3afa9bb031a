//! Fluent query builder for collections
//!
//! ## Design
//!
//! `DocumentQuery` composes a text clause (full-text or fuzzy), exact-match
//! metadata filters, a sort, and pagination into one SQL statement against
//! the row store. Metadata is addressed by flattened field path
//! (`user.address.city`) through SQLite's `json_extract`; paths travel as
//! bound parameters, never by string interpolation.
//!
//! Scoring follows the collection engine's conventions: FTS queries score
//! by the best (minimum) rank across matching fields, fuzzy queries by the
//! shared-trigram count. Pure filter queries have no score and sort by the
//! requested field, or by id for determinism.

use rusqlite::ToSql;
use serde_json::Value;

use beaver_core::{Error, Result};

use crate::collection::CollectionManager;
use crate::document::{trigrams, Document, FIELD_SEPARATOR};

/// Sort direction for [`DocumentQuery::sort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// A document together with its query score, when the query produced one.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    /// The matched document.
    pub document: Document,
    /// FTS rank (lower is better) or shared-trigram count (higher is
    /// better); `None` for pure filter queries.
    pub score: Option<f64>,
}

enum TextClause {
    Fts {
        query: String,
        on: Option<Vec<String>>,
    },
    Fuzzy {
        query: String,
        fuzziness: u32,
    },
}

/// A composable query over one collection.
///
/// Built by [`CollectionManager::query`]; consumed by
/// [`DocumentQuery::execute`].
pub struct DocumentQuery<'a> {
    collection: &'a CollectionManager,
    text: Option<TextClause>,
    filters: Vec<(String, Value)>,
    sort: Option<(String, SortOrder)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl<'a> DocumentQuery<'a> {
    pub(crate) fn new(collection: &'a CollectionManager) -> Self {
        DocumentQuery {
            collection,
            text: None,
            filters: Vec::new(),
            sort: None,
            limit: None,
            offset: None,
        }
    }

    /// Add a full-text clause, optionally restricted to field paths.
    ///
    /// Replaces any previous text clause.
    pub fn fts(mut self, query: &str, on: Option<Vec<String>>) -> Self {
        self.text = Some(TextClause::Fts {
            query: query.to_string(),
            on,
        });
        self
    }

    /// Add a fuzzy (trigram) clause bounding the allowed edit distance.
    ///
    /// Replaces any previous text clause.
    pub fn fuzzy(mut self, query: &str, fuzziness: u32) -> Self {
        self.text = Some(TextClause::Fuzzy {
            query: query.to_string(),
            fuzziness,
        });
        self
    }

    /// Require an exact match on a flattened metadata field.
    pub fn filter(mut self, field_path: &str, value: Value) -> Self {
        self.filters.push((field_path.to_string(), value));
        self
    }

    /// Sort by a metadata field. Ignored when a text clause provides the
    /// ordering.
    pub fn sort(mut self, field_path: &str, order: SortOrder) -> Self {
        self.sort = Some((field_path.to_string(), order));
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` results. Only meaningful with `limit`.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn json_path(field_path: &str) -> String {
        // serde-style dotted path to SQLite json_extract syntax.
        format!("$.{}", field_path.replace(FIELD_SEPARATOR, "."))
    }

    /// Compile and run the query.
    ///
    /// Parameters are collected in three segments (join, where, tail) and
    /// concatenated in that order so they line up with placeholder order in
    /// the final SQL text.
    pub fn execute(self) -> Result<Vec<ScoredDocument>> {
        let mut join_params: Vec<Box<dyn ToSql>> = Vec::new();
        let mut where_params: Vec<Box<dyn ToSql>> = Vec::new();
        let mut tail_params: Vec<Box<dyn ToSql>> = Vec::new();

        let mut select = String::from("SELECT d.item_id, d.item_vector, d.metadata");
        let mut joins = String::new();
        let mut wheres = vec!["d.collection = ?".to_string()];
        let mut group_by = String::new();
        let mut order_by = String::new();

        let collection_name = self.collection.name().to_string();
        where_params.push(Box::new(collection_name.clone()));

        match &self.text {
            Some(TextClause::Fts { query, on }) => {
                select.push_str(", MIN(f.rank) AS score");
                joins.push_str(
                    " JOIN beaver_fts_index f
                      ON d.collection = f.collection AND d.item_id = f.item_id",
                );
                wheres.push("beaver_fts_index MATCH ?".to_string());
                where_params.push(Box::new(query.clone()));
                if let Some(on) = on {
                    if !on.is_empty() {
                        let placeholders = vec!["?"; on.len()].join(",");
                        wheres.push(format!("f.field_path IN ({placeholders})"));
                        for field in on {
                            where_params.push(Box::new(field.clone()));
                        }
                    }
                }
                group_by = " GROUP BY d.item_id".to_string();
                order_by = " ORDER BY score".to_string();
            }
            Some(TextClause::Fuzzy { query, fuzziness }) => {
                let grams = trigrams(query);
                if grams.is_empty() {
                    return Ok(Vec::new());
                }
                let threshold = (grams.len() as i64 - 3 * *fuzziness as i64).max(1);
                let placeholders = vec!["?"; grams.len()].join(",");

                select.push_str(", t.matches AS score");
                joins.push_str(&format!(
                    " JOIN (
                         SELECT item_id, COUNT(DISTINCT trigram) AS matches
                         FROM beaver_trigrams
                         WHERE collection = ? AND trigram IN ({placeholders})
                         GROUP BY item_id
                         HAVING matches >= ?
                     ) t ON d.item_id = t.item_id"
                ));
                join_params.push(Box::new(collection_name.clone()));
                for gram in grams {
                    join_params.push(Box::new(gram));
                }
                join_params.push(Box::new(threshold));
                order_by = " ORDER BY score DESC, d.item_id ASC".to_string();
            }
            None => {
                select.push_str(", NULL AS score");
            }
        }

        for (field_path, value) in &self.filters {
            wheres.push("json_extract(d.metadata, ?) = ?".to_string());
            where_params.push(Box::new(Self::json_path(field_path)));
            where_params.push(filter_param(value)?);
        }

        if order_by.is_empty() {
            match &self.sort {
                Some((field_path, order)) => {
                    let direction = match order {
                        SortOrder::Ascending => "ASC",
                        SortOrder::Descending => "DESC",
                    };
                    order_by = format!(" ORDER BY json_extract(d.metadata, ?) {direction}");
                    tail_params.push(Box::new(Self::json_path(field_path)));
                }
                None => {
                    order_by = " ORDER BY d.item_id ASC".to_string();
                }
            }
        }

        let mut tail = String::new();
        if let Some(limit) = self.limit {
            tail.push_str(" LIMIT ?");
            tail_params.push(Box::new(limit as i64));
            if let Some(offset) = self.offset {
                tail.push_str(" OFFSET ?");
                tail_params.push(Box::new(offset as i64));
            }
        }

        let sql = format!(
            "{select} FROM beaver_collections d{joins} WHERE {}{group_by}{order_by}{tail}",
            wheres.join(" AND ")
        );

        let mut owned = join_params;
        owned.append(&mut where_params);
        owned.append(&mut tail_params);

        self.collection.storage().with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();
            let rows = stmt.query_map(&refs[..], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            })?;

            let mut results = Vec::new();
            for row in rows {
                let (item_id, vector_bytes, metadata_json, score) = row?;
                let embedding = match vector_bytes {
                    Some(bytes) => Some(crate::vector::decode_vector(&bytes)?),
                    None => None,
                };
                results.push(ScoredDocument {
                    document: Document {
                        id: item_id,
                        embedding,
                        metadata: beaver_core::from_json(&metadata_json)?,
                    },
                    score,
                });
            }
            Ok(results)
        })
    }
}

/// Convert a JSON scalar into the value `json_extract` yields for it.
fn filter_param(value: &Value) -> Result<Box<dyn ToSql>> {
    match value {
        Value::Null => Ok(Box::new(None::<i64>)),
        Value::Bool(b) => Ok(Box::new(*b as i64)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Box::new(i))
            } else {
                Ok(Box::new(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => Ok(Box::new(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(Error::InvalidArgument(
            "filters compare scalars; arrays and objects are not supported".into(),
        )),
    }
}
