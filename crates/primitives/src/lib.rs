//! Named data-structure managers for BeaverDB
//!
//! Each manager is a concrete view over one namespace of the shared file:
//! - DictManager: key-value map with optional per-key TTL
//! - ListManager: ordered list with O(1) positional inserts
//! - QueueManager: priority queue with blocking consumption
//! - BlobManager: binary payloads with JSON metadata
//! - LogManager: append-only time-indexed log with live tailing
//! - ChannelManager: pub/sub over a globally ordered message log
//! - SketchManager: probabilistic cardinality and membership in one blob
//!
//! All of them share the [`manager::ManagerCore`] pattern: a public
//! inter-process lock for batching, a per-thread coherent cache, and
//! mutations that bump the namespace's registry version atomically.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod channel;
pub mod dict;
pub mod list;
pub mod log;
pub mod manager;
pub mod queue;
pub mod sketch;

pub use blob::{Blob, BlobManager};
pub use channel::{ChannelManager, Message, Subscriber};
pub use dict::DictManager;
pub use list::ListManager;
pub use log::{LiveTail, LogEntry, LogManager, RangeQuery};
pub use manager::ManagerCore;
pub use queue::{QueueItem, QueueManager};
pub use sketch::{ApproximateSet, SketchManager};
