//! Wall-clock helpers
//!
//! Every persisted timestamp in BeaverDB is a `f64` of seconds since the
//! Unix epoch with microsecond resolution, matching the REAL columns in the
//! on-disk schema. Collision retries in the log, pub/sub, and lock manager
//! step by [`MICROSECOND`].

use chrono::Utc;

/// One microsecond in seconds; the step used by timestamp-collision retries.
pub const MICROSECOND: f64 = 1e-6;

/// Current wall-clock time as seconds since the Unix epoch.
pub fn now() -> f64 {
    let ts = Utc::now();
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) * MICROSECOND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_enough() {
        let a = now();
        let b = now();
        assert!(b >= a);
        // Sanity: after 2020, before 2100.
        assert!(a > 1.577e9 && a < 4.1e9);
    }
}
