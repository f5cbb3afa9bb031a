//! Core types for BeaverDB
//!
//! This crate defines the foundations shared by every layer:
//! - Error: the unified error type hierarchy
//! - Result: crate-wide result alias
//! - Time helpers: f64 epoch-second timestamps and the microsecond step
//! - JSON helpers: the (de)serialization seam used by all managers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod json;
pub mod time;

pub use error::{Error, Result};
pub use json::{from_json, to_json};
pub use time::{now, MICROSECOND};
