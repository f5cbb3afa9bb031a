//! BeaverDB: an embedded multi-modal data store in a single SQLite file
//!
//! One file, one library, several logically independent data structures:
//! namespaced dictionaries, ordered lists, priority queues, blob stores,
//! time-indexed logs, pub/sub channels, fair inter-process locks, and
//! document collections combining full-text search, fuzzy trigram search,
//! exact vector search, and a labeled directed graph.
//!
//! # Example
//!
//! ```no_run
//! use beaverdb::{Database, Document, IndexRequest};
//!
//! # fn main() -> beaverdb::Result<()> {
//! let db = Database::open("app.db")?;
//!
//! // Key-value with TTL
//! let sessions = db.dict("sessions")?;
//! sessions.set("token", &"abc123", Some(60.0))?;
//!
//! // Priority queue
//! let jobs = db.queue("jobs")?;
//! jobs.put(&"send-email", 1.0)?;
//!
//! // Documents with vector search
//! let docs = db.collection("articles")?;
//! let doc = Document::new(serde_json::json!({"title": "hello"}))
//!     .with_embedding(vec![0.1, 0.9]);
//! docs.index(&doc, &IndexRequest::default())?;
//! let hits = docs.search(&[0.1, 0.9], 5)?;
//! # Ok(())
//! # }
//! ```
//!
//! Multiple processes may open the same file; coherence is maintained
//! through a shared version registry, a vector change-log, and fair
//! SQLite-backed advisory locks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use beaver_core::{Error, Result};

pub use beaver_concurrency::{BeaverLock, Cache, CacheStats, LockGuard, LockOptions};

pub use beaver_engine::{Database, DatabaseOptions, LIBRARY_VERSION};

pub use beaver_primitives::{
    ApproximateSet, Blob, BlobManager, ChannelManager, DictManager, ListManager, LiveTail,
    LogEntry, LogManager, Message, QueueItem, QueueManager, RangeQuery, SketchManager, Subscriber,
};

pub use beaver_search::{
    rerank, CollectionManager, Direction, Document, DocumentQuery, FtsMode, IndexRequest,
    MatchRequest, ScoredDocument, SortOrder, VectorIndex,
};
