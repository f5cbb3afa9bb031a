//! Storage layer for BeaverDB
//!
//! This crate implements the substrate every higher layer sits on:
//! - Storage: per-thread connections to the single SQLite file, WAL mode,
//!   lazy creation, in-memory thread confinement, close semantics
//! - Schema bootstrap: idempotent creation of every `beaver_*` table
//! - Version registry: the atomic per-namespace counters that drive
//!   coherent cache invalidation across threads and processes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod registry;
pub mod schema;
pub mod substrate;

pub use substrate::{OpenOptions, Storage};
