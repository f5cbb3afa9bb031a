//! Database engine for BeaverDB
//!
//! This crate wires the lower layers together:
//! - Database: the single entry point with open/close lifecycle
//! - Factories: process-singleton managers per `(kind, name)`
//! - Discovery: user-visible names per manager kind
//! - Metadata: library-version stamping with skew warnings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod database;

pub use database::{Database, DatabaseOptions, LIBRARY_VERSION};
