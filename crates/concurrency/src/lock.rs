//! Inter-process advisory lock manager
//!
//! ## Design
//!
//! A fair (FIFO) and deadlock-resistant lock built on the shared
//! `beaver_lock_waiters` table. Waiters insert a row stamped with their
//! request time; the row with the minimum `requested_at` among non-expired
//! rows is the holder. Fairness is strict service order by enqueue time.
//!
//! Deadlock resistance comes from TTLs: every row carries an `expires_at`,
//! and each poll pass deletes expired rows first, so a crashed holder is
//! reclaimed after at most one TTL. Live holders extend their lease with
//! `renew`.
//!
//! The `(lock_name, requested_at)` primary key doubles as the fairness
//! tie-break: two waiters enqueueing in the same microsecond collide on
//! insert, and the loser nudges its request time forward one microsecond
//! and retries, the same shape as the log manager's timestamp-collision
//! retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rusqlite::{params, OptionalExtension};

use beaver_core::{now, Error, Result, MICROSECOND};
use beaver_storage::Storage;

/// Construction-time settings for a [`BeaverLock`].
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Max seconds a blocking acquire waits. `None` waits forever.
    pub timeout: Option<f64>,
    /// Seconds the lock may be held before it auto-expires.
    pub lock_ttl: f64,
    /// Seconds between acquisition polls.
    pub poll_interval: f64,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            timeout: None,
            lock_ttl: 60.0,
            poll_interval: 0.1,
        }
    }
}

/// A named inter-process lock handle.
///
/// Multiple handles for the same name may exist across threads and
/// processes; each carries its own unique waiter identity.
pub struct BeaverLock {
    storage: Arc<Storage>,
    name: String,
    options: LockOptions,
    waiter_id: String,
    acquired: AtomicBool,
}

impl BeaverLock {
    /// Create a lock handle for `name`.
    ///
    /// Fails with *invalid-argument* on an empty name or non-positive
    /// ttl/poll interval.
    pub fn new(storage: Arc<Storage>, name: &str, options: LockOptions) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "lock name must be a non-empty string".into(),
            ));
        }
        if options.lock_ttl <= 0.0 {
            return Err(Error::InvalidArgument("lock_ttl must be positive".into()));
        }
        if options.poll_interval <= 0.0 {
            return Err(Error::InvalidArgument(
                "poll_interval must be positive".into(),
            ));
        }

        Ok(BeaverLock {
            storage,
            name: name.to_string(),
            options,
            waiter_id: format!("pid:{}:id:{}", std::process::id(), uuid::Uuid::new_v4()),
            acquired: AtomicBool::new(false),
        })
    }

    /// The lock's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle currently holds the lock.
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Blocking acquire using the handle's configured settings.
    ///
    /// Returns `Ok(true)` once the lock is held. A configured timeout that
    /// expires surfaces as `Error::Timeout` with no waiter residue.
    pub fn acquire(&self) -> Result<bool> {
        self.acquire_inner(&self.options, true)
    }

    /// Blocking acquire with an explicit timeout in seconds.
    pub fn acquire_for(&self, timeout: f64) -> Result<bool> {
        let options = LockOptions {
            timeout: Some(timeout),
            ..self.options.clone()
        };
        self.acquire_inner(&options, true)
    }

    /// Acquire with full per-call overrides of timeout, TTL, and poll
    /// interval.
    pub fn acquire_with(&self, options: &LockOptions, block: bool) -> Result<bool> {
        if options.lock_ttl <= 0.0 {
            return Err(Error::InvalidArgument("lock_ttl must be positive".into()));
        }
        if options.poll_interval <= 0.0 {
            return Err(Error::InvalidArgument(
                "poll_interval must be positive".into(),
            ));
        }
        self.acquire_inner(options, block)
    }

    /// Non-blocking acquire: one queue pass, then `Ok(false)` if someone
    /// else is ahead.
    pub fn try_acquire(&self) -> Result<bool> {
        self.acquire_inner(&self.options, false)
    }

    fn acquire_inner(&self, options: &LockOptions, block: bool) -> Result<bool> {
        if self.is_acquired() {
            // This handle already holds the lock.
            return Ok(true);
        }

        let start = Instant::now();
        self.enqueue(options.lock_ttl)?;

        let result = self.poll_until_front(options, block, start);
        if !matches!(result, Ok(true)) {
            // Timed out, lost a non-blocking race, or hit a storage error:
            // leave no waiter residue behind.
            self.remove_from_queue();
        }
        result
    }

    /// Insert our waiter row, stepping the request time by one microsecond
    /// on a primary-key collision.
    fn enqueue(&self, lock_ttl: f64) -> Result<()> {
        let mut requested_at = now();
        loop {
            let inserted = self.storage.with_conn(|conn| {
                match conn.execute(
                    "INSERT INTO beaver_lock_waiters (lock_name, waiter_id, requested_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        self.name,
                        self.waiter_id,
                        requested_at,
                        requested_at + lock_ttl
                    ],
                ) {
                    Ok(_) => Ok(true),
                    Err(err) => {
                        let err = Error::from(err);
                        if err.is_constraint_violation() {
                            Ok(false)
                        } else {
                            Err(err)
                        }
                    }
                }
            })?;
            if inserted {
                return Ok(());
            }
            requested_at += MICROSECOND;
        }
    }

    fn poll_until_front(&self, options: &LockOptions, block: bool, start: Instant) -> Result<bool> {
        loop {
            let at_front = self.storage.with_txn(|tx| {
                // Reclaim crashed holders and stale waiters.
                tx.execute(
                    "DELETE FROM beaver_lock_waiters WHERE lock_name = ?1 AND expires_at < ?2",
                    params![self.name, now()],
                )?;

                let front: Option<String> = tx
                    .query_row(
                        "SELECT waiter_id FROM beaver_lock_waiters
                         WHERE lock_name = ?1
                         ORDER BY requested_at ASC
                         LIMIT 1",
                        params![self.name],
                        |row| row.get(0),
                    )
                    .optional()?;

                Ok(front.as_deref() == Some(self.waiter_id.as_str()))
            })?;

            if at_front {
                self.acquired.store(true, Ordering::SeqCst);
                return Ok(true);
            }

            if !block {
                return Ok(false);
            }
            if let Some(timeout) = options.timeout {
                if start.elapsed().as_secs_f64() > timeout {
                    return Err(Error::Timeout(format!(
                        "could not acquire lock '{}' within {timeout}s",
                        self.name
                    )));
                }
            }

            // +/- 10% jitter to avoid a thundering herd of pollers.
            let jitter = rand::thread_rng().gen_range(0.9..=1.1);
            std::thread::sleep(Duration::from_secs_f64(options.poll_interval * jitter));
        }
    }

    /// Best-effort removal of our waiter row; never raises.
    fn remove_from_queue(&self) {
        let result = self.storage.with_conn(|conn| {
            conn.execute(
                "DELETE FROM beaver_lock_waiters WHERE lock_name = ?1 AND waiter_id = ?2",
                params![self.name, self.waiter_id],
            )?;
            Ok(())
        });
        if let Err(err) = result {
            tracing::warn!(lock = %self.name, %err, "failed to remove lock waiter");
        }
    }

    /// Release the lock so the next waiter can take it. Safe to call when
    /// the lock is not held; idempotent.
    pub fn release(&self) {
        if !self.acquired.swap(false, Ordering::SeqCst) {
            return;
        }
        self.remove_from_queue();
    }

    /// Heartbeat: extend the lease to `now + ttl` if our row still exists.
    ///
    /// Returns whether a row was updated; `false` signals the lock was lost
    /// (expired and reclaimed, or cleared).
    pub fn renew(&self, lock_ttl: Option<f64>) -> Result<bool> {
        if !self.is_acquired() {
            return Ok(false);
        }
        let ttl = lock_ttl.unwrap_or(self.options.lock_ttl);
        if ttl <= 0.0 {
            return Err(Error::InvalidArgument("lock_ttl must be positive".into()));
        }

        let renewed = self.storage.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE beaver_lock_waiters SET expires_at = ?1
                 WHERE lock_name = ?2 AND waiter_id = ?3",
                params![now() + ttl, self.name, self.waiter_id],
            )?;
            Ok(rows > 0)
        })?;
        Ok(renewed)
    }

    /// Forcibly remove ALL waiters for this name, holder included. Breaks
    /// stuck locks and cancels every queued contender.
    pub fn clear(&self) -> Result<bool> {
        let cleared = self.storage.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM beaver_lock_waiters WHERE lock_name = ?1",
                params![self.name],
            )?;
            Ok(rows > 0)
        })?;
        self.acquired.store(false, Ordering::SeqCst);
        Ok(cleared)
    }

    /// Acquire and return an RAII guard that releases on drop.
    pub fn guard(&self) -> Result<LockGuard<'_>> {
        if self.acquire()? {
            Ok(LockGuard { lock: self })
        } else {
            Err(Error::Timeout(format!(
                "could not acquire lock '{}'",
                self.name
            )))
        }
    }
}

impl std::fmt::Debug for BeaverLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeaverLock")
            .field("name", &self.name)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

/// Scoped lock acquisition; releases the lock when dropped.
pub struct LockGuard<'a> {
    lock: &'a BeaverLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
