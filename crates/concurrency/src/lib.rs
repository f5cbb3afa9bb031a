//! Concurrency layer for BeaverDB
//!
//! This crate implements the two coordination primitives every manager
//! leans on:
//! - BeaverLock: fair FIFO inter-process advisory locks with TTL
//!   reclamation, heartbeat renewal, and forced clear
//! - LocalCache / DummyCache: per-thread coherent caches that revalidate
//!   lazily against the shared version registry

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod lock;

pub use cache::{Cache, CacheRegistry, CacheStats, DummyCache, LocalCache};
pub use lock::{BeaverLock, LockGuard, LockOptions};
