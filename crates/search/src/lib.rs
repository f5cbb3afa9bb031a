//! Collection engine for BeaverDB
//!
//! This crate implements the document side of the store:
//! - Document: id + optional embedding + JSON metadata, with field
//!   flattening and trigram generation
//! - CollectionManager: atomic upsert across row store, FTS5, trigrams,
//!   vector change-log, and edges; full-text, fuzzy, and vector search;
//!   graph traversal
//! - DocumentQuery: fluent composition of text clauses, metadata filters,
//!   sorting, and pagination
//! - VectorIndex: the two-tier in-memory index synchronized across
//!   processes through the shared change-log
//! - rerank: reciprocal-rank fusion over result lists

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collection;
pub mod document;
pub mod graph;
pub mod query;
pub mod rerank;
pub mod vector;

pub use collection::{CollectionManager, FtsMode, IndexRequest, MatchRequest};
pub use document::{flatten_strings, trigrams, Document, FIELD_SEPARATOR};
pub use graph::Direction;
pub use query::{DocumentQuery, ScoredDocument, SortOrder};
pub use rerank::rerank;
pub use vector::{VectorIndex, DELETE_OPERATION, INSERT_OPERATION};
