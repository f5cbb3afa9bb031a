//! SketchManager: persistent probabilistic cardinality and membership
//!
//! ## Design
//!
//! An `ApproximateSet` packs a HyperLogLog (cardinality estimation) and a
//! Bloom filter (membership) into one binary block: the first `m = 2^p`
//! bytes are the HLL registers, the rest the filter's bit array. Both are
//! sized from the same `(capacity, error_rate)` pair, persisted in a single
//! BLOB row, and updated read-modify-write inside one transaction so
//! concurrent writers across processes never lose increments.
//!
//! Items hash with xxh3: the 64-bit variant feeds the HLL register choice
//! and rank, the 128-bit variant supplies the two halves of the Bloom
//! filter's double-hashing scheme.
//!
//! Single-item `add` reloads and rewrites the whole blob; `add_many` exists
//! so bulk loads pay that cost once.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use xxhash_rust::xxh3::{xxh3_128, xxh3_64};

use beaver_concurrency::{CacheRegistry, LockGuard};
use beaver_core::{to_json, Error, Result};
use beaver_storage::Storage;

use crate::manager::ManagerCore;

/// Derive the HyperLogLog precision `p` from a desired error rate.
///
/// `error ≈ 1.04 / sqrt(2^p)`, clamped to 4..=18.
fn hll_precision(error_rate: f64) -> Result<u32> {
    if !(0.0..1.0).contains(&error_rate) || error_rate == 0.0 {
        return Err(Error::InvalidArgument(
            "error_rate must be between 0 and 1".into(),
        ));
    }
    let p = (2.0 * (1.04 / error_rate).log2()).ceil() as i64;
    Ok(p.clamp(4, 18) as u32)
}

/// Optimal Bloom filter size in bits and hash count for the target
/// capacity and error rate.
fn bloom_params(capacity: u64, error_rate: f64) -> Result<(u64, u32)> {
    if capacity == 0 {
        return Err(Error::InvalidArgument("capacity must be positive".into()));
    }
    if !(0.0..1.0).contains(&error_rate) || error_rate == 0.0 {
        return Err(Error::InvalidArgument(
            "error_rate must be between 0 and 1".into(),
        ));
    }

    let ln2 = std::f64::consts::LN_2;
    let m_bits = -(capacity as f64 * error_rate.ln()) / (ln2 * ln2);
    let k = (m_bits / capacity as f64) * ln2;
    Ok((m_bits.ceil() as u64, k.ceil() as u32))
}

fn hll_alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}

/// A combined HyperLogLog + Bloom filter over one byte buffer.
#[derive(Debug, Clone)]
pub struct ApproximateSet {
    precision: u32,
    registers: usize,
    alpha: f64,
    bloom_bits: u64,
    bloom_hashes: u32,
    data: Vec<u8>,
}

impl ApproximateSet {
    /// Create an empty sketch sized for `capacity` items at `error_rate`.
    pub fn new(capacity: u64, error_rate: f64) -> Result<Self> {
        let precision = hll_precision(error_rate)?;
        let registers = 1usize << precision;
        let (bloom_bits, bloom_hashes) = bloom_params(capacity, error_rate)?;
        let bloom_bytes = ((bloom_bits + 7) / 8) as usize;

        Ok(ApproximateSet {
            precision,
            registers,
            alpha: hll_alpha(registers),
            bloom_bits,
            bloom_hashes,
            data: vec![0; registers + bloom_bytes],
        })
    }

    /// Rehydrate a sketch from its persisted bytes.
    ///
    /// The byte length is fully determined by `(capacity, error_rate)`;
    /// anything else is *corruption*.
    pub fn from_bytes(capacity: u64, error_rate: f64, data: Vec<u8>) -> Result<Self> {
        let mut sketch = Self::new(capacity, error_rate)?;
        if data.len() != sketch.data.len() {
            return Err(Error::Corruption(format!(
                "sketch blob of {} bytes, expected {}",
                data.len(),
                sketch.data.len()
            )));
        }
        sketch.data = data;
        Ok(sketch)
    }

    /// The persisted byte form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Add an item to both components.
    pub fn insert(&mut self, item: &[u8]) {
        self.insert_hll(item);
        self.insert_bloom(item);
    }

    fn insert_hll(&mut self, item: &[u8]) {
        let x = xxh3_64(item);
        let register = (x & (self.registers as u64 - 1)) as usize;
        let w = x >> self.precision;
        let rank = (w.trailing_zeros().min(64 - self.precision) + 1) as u8;
        if rank > self.data[register] {
            self.data[register] = rank;
        }
    }

    fn bloom_slots(&self, item: &[u8]) -> impl Iterator<Item = (usize, u8)> + '_ {
        let h = xxh3_128(item);
        let h1 = h as u64;
        let h2 = (h >> 64) as u64;
        let offset = self.registers;
        let bits = self.bloom_bits;
        (0..self.bloom_hashes as u64).map(move |i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % bits;
            (offset + (bit / 8) as usize, 1u8 << (bit % 8))
        })
    }

    fn insert_bloom(&mut self, item: &[u8]) {
        let slots: Vec<(usize, u8)> = self.bloom_slots(item).collect();
        for (byte, mask) in slots {
            self.data[byte] |= mask;
        }
    }

    /// Probabilistic membership: false positives at roughly the configured
    /// error rate, never false negatives.
    pub fn contains(&self, item: &[u8]) -> bool {
        self.bloom_slots(item)
            .all(|(byte, mask)| self.data[byte] & mask != 0)
    }

    /// Estimated number of distinct items, with the small-range linear
    /// counting correction.
    pub fn cardinality(&self) -> u64 {
        let mut zeros = 0usize;
        let mut sum_inv = 0.0f64;
        for &register in &self.data[..self.registers] {
            if register == 0 {
                zeros += 1;
            }
            sum_inv += 2.0f64.powi(-i32::from(register));
        }

        let m = self.registers as f64;
        let mut estimate = self.alpha * m * m / sum_inv;
        if estimate <= 2.5 * m && zeros > 0 {
            estimate = m * (m / zeros as f64).ln();
        }
        estimate as u64
    }
}

/// A named persistent sketch stored in `beaver_sketches`.
pub struct SketchManager {
    core: ManagerCore,
    capacity: u64,
    error_rate: f64,
    sketch: Mutex<ApproximateSet>,
}

impl SketchManager {
    pub(crate) const KIND: &'static str = "sketch";

    /// Open or create the sketch `name`.
    ///
    /// Reopening with a different `(capacity, error_rate)` than the stored
    /// one is *invalid-argument*: the binary layout depends on them.
    pub fn new(
        name: &str,
        capacity: u64,
        error_rate: f64,
        storage: Arc<Storage>,
        caches: Arc<CacheRegistry>,
    ) -> Result<Self> {
        let core = ManagerCore::new(Self::KIND, name, storage, caches)?;

        let existing: Option<(i64, f64, Vec<u8>)> = core.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT capacity, error_rate, data FROM beaver_sketches WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?)
        })?;

        let sketch = match existing {
            Some((stored_capacity, stored_error, data)) => {
                if stored_capacity as u64 != capacity || (stored_error - error_rate).abs() > 1e-9 {
                    return Err(Error::InvalidArgument(format!(
                        "sketch '{name}' exists with capacity={stored_capacity}, \
                         error_rate={stored_error}; cannot reopen with \
                         capacity={capacity}, error_rate={error_rate}"
                    )));
                }
                ApproximateSet::from_bytes(capacity, error_rate, data)?
            }
            None => {
                let fresh = ApproximateSet::new(capacity, error_rate)?;
                core.mutate(|tx| Self::save(tx, name, capacity, error_rate, fresh.as_bytes()))?;
                fresh
            }
        };

        Ok(SketchManager {
            core,
            capacity,
            error_rate,
            sketch: Mutex::new(sketch),
        })
    }

    /// The sketch's name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Acquire the public lock for a batch of operations.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.core.lock_guard()
    }

    fn save(
        conn: &Connection,
        name: &str,
        capacity: u64,
        error_rate: f64,
        data: &[u8],
    ) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO beaver_sketches (name, type, capacity, error_rate, data)
             VALUES (?1, 'approx_set', ?2, ?3, ?4)",
            params![name, capacity as i64, error_rate, data],
        )?;
        Ok(())
    }

    fn reload(&self, conn: &Connection, sketch: &mut ApproximateSet) -> Result<()> {
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM beaver_sketches WHERE name = ?1",
                params![self.core.name()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(data) = data {
            *sketch = ApproximateSet::from_bytes(self.capacity, self.error_rate, data)?;
        }
        Ok(())
    }

    /// Add one item.
    ///
    /// Reloads, updates, and rewrites the whole blob; prefer
    /// [`SketchManager::add_many`] for bulk loads.
    pub fn add<T: Serialize>(&self, item: &T) -> Result<()> {
        self.add_many(std::slice::from_ref(item))
    }

    /// Add a batch of items in one read-modify-write transaction.
    pub fn add_many<T: Serialize>(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut serialized = Vec::with_capacity(items.len());
        for item in items {
            serialized.push(to_json(item)?);
        }

        let mut sketch = self.sketch.lock();
        self.core.mutate(|tx| {
            // Merge on top of the latest persisted state so concurrent
            // writers in other processes are not overwritten.
            self.reload(tx, &mut sketch)?;
            for raw in &serialized {
                sketch.insert(raw.as_bytes());
            }
            Self::save(
                tx,
                self.core.name(),
                self.capacity,
                self.error_rate,
                sketch.as_bytes(),
            )
        })
    }

    /// Probabilistic membership for `item`.
    pub fn contains<T: Serialize>(&self, item: &T) -> Result<bool> {
        let raw = to_json(item)?;
        let mut sketch = self.sketch.lock();
        self.core.read(|conn| self.reload(conn, &mut sketch))?;
        Ok(sketch.contains(raw.as_bytes()))
    }

    /// Estimated number of distinct items added.
    pub fn count(&self) -> Result<u64> {
        let mut sketch = self.sketch.lock();
        self.core.read(|conn| self.reload(conn, &mut sketch))?;
        Ok(sketch.cardinality())
    }

    /// Serialize the sketch's parameters and estimate to a JSON object.
    pub fn dump(&self) -> Result<Value> {
        Ok(json!({
            "metadata": {
                "type": "Sketch",
                "name": self.core.name(),
                "capacity": self.capacity,
                "error_rate": self.error_rate,
            },
            "estimated_count": self.count()?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beaver_storage::OpenOptions;
    use tempfile::TempDir;

    #[test]
    fn precision_and_bloom_sizing() {
        assert_eq!(hll_precision(0.01).unwrap(), 14);
        assert_eq!(hll_precision(0.9).unwrap(), 4);
        assert!(hll_precision(0.0).is_err());
        assert!(hll_precision(1.5).is_err());

        let (bits, hashes) = bloom_params(1000, 0.01).unwrap();
        // Classic figures: ~9.6 bits and ~7 hashes per item at 1% error.
        assert!((9_500..9_700).contains(&bits));
        assert_eq!(hashes, 7);
        assert!(bloom_params(0, 0.01).is_err());
    }

    #[test]
    fn membership_has_no_false_negatives() {
        let mut set = ApproximateSet::new(10_000, 0.01).unwrap();
        for i in 0..1000 {
            set.insert(format!("item-{i}").as_bytes());
        }
        for i in 0..1000 {
            assert!(set.contains(format!("item-{i}").as_bytes()));
        }
    }

    #[test]
    fn cardinality_is_close_for_known_sets() {
        let mut set = ApproximateSet::new(100_000, 0.01).unwrap();
        for i in 0..10_000 {
            set.insert(format!("user:{i}").as_bytes());
        }
        let estimate = set.cardinality() as f64;
        // p = 14 gives ~0.8% standard error; allow a generous 5%.
        assert!((9_500.0..10_500.0).contains(&estimate), "estimate {estimate}");
    }

    #[test]
    fn duplicates_do_not_inflate_the_estimate() {
        let mut set = ApproximateSet::new(10_000, 0.01).unwrap();
        for _ in 0..50 {
            for i in 0..100 {
                set.insert(format!("dup-{i}").as_bytes());
            }
        }
        let estimate = set.cardinality();
        assert!(estimate >= 90 && estimate <= 110, "estimate {estimate}");
    }

    #[test]
    fn byte_round_trip() {
        let mut set = ApproximateSet::new(1000, 0.05).unwrap();
        set.insert(b"alpha");
        set.insert(b"beta");

        let restored =
            ApproximateSet::from_bytes(1000, 0.05, set.as_bytes().to_vec()).unwrap();
        assert!(restored.contains(b"alpha"));
        assert_eq!(restored.cardinality(), set.cardinality());

        let err = ApproximateSet::from_bytes(1000, 0.05, vec![0; 3]).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    fn open_sketch(name: &str) -> (TempDir, Arc<Storage>, SketchManager) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sketch.db");
        let storage = Storage::open(path.to_str().unwrap(), OpenOptions::default()).unwrap();
        let caches = Arc::new(CacheRegistry::new(
            Arc::clone(&storage),
            true,
            CacheRegistry::DEFAULT_CHECK_INTERVAL,
        ));
        let sketch =
            SketchManager::new(name, 10_000, 0.01, Arc::clone(&storage), caches).unwrap();
        (dir, storage, sketch)
    }

    #[test]
    fn manager_persists_across_handles() {
        let (_dir, storage, sketch) = open_sketch("visitors");
        sketch.add(&"alice").unwrap();
        sketch.add_many(&["bob", "charlie"]).unwrap();

        assert!(sketch.contains(&"alice").unwrap());
        assert!(!sketch.contains(&"nobody-here").unwrap());

        // A second handle (another process) sees the same state.
        let caches = Arc::new(CacheRegistry::new(Arc::clone(&storage), true, 0.1));
        let other = SketchManager::new("visitors", 10_000, 0.01, storage, caches).unwrap();
        assert!(other.contains(&"bob").unwrap());
        assert_eq!(other.count().unwrap(), 3);
    }

    #[test]
    fn mismatched_parameters_are_rejected() {
        let (_dir, storage, _sketch) = open_sketch("fixed");
        let caches = Arc::new(CacheRegistry::new(Arc::clone(&storage), true, 0.1));
        let result = SketchManager::new("fixed", 99, 0.01, storage, caches);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn dump_reports_parameters() {
        let (_dir, _storage, sketch) = open_sketch("stats");
        sketch.add(&1).unwrap();
        let dump = sketch.dump().unwrap();
        assert_eq!(dump["metadata"]["type"], "Sketch");
        assert_eq!(dump["metadata"]["capacity"], 10_000);
    }
}
