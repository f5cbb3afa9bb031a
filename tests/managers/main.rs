//! Manager-level contract tests over the public `beaverdb` surface
//!
//! Round-trip laws, boundary cases, and cross-thread behavior for the
//! simple data-structure managers and the lock primitive.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use beaverdb::{Database, DatabaseOptions, Error, LockOptions};

/// Route `tracing` output through the test harness. Safe to call from
/// every test; only the first call installs the subscriber.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn open_temp() -> (TempDir, Arc<Database>) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("managers.db");
    let db = Arc::new(Database::open(path.to_str().unwrap()).unwrap());
    (dir, db)
}

// ============================================================================
// Round-trip laws
// ============================================================================

#[test]
fn dict_last_write_wins() {
    let (_dir, db) = open_temp();
    let dict = db.dict("kv").unwrap();

    dict.set("k", &"v1", None).unwrap();
    dict.set("k", &"v2", None).unwrap();
    assert_eq!(dict.get::<String>("k").unwrap(), Some("v2".to_string()));
}

#[test]
fn blob_last_write_wins() {
    let (_dir, db) = open_temp();
    let blobs = db.blob("files").unwrap();

    blobs.put::<serde_json::Value>("k", b"v1", None).unwrap();
    blobs.put::<serde_json::Value>("k", b"v2", None).unwrap();
    assert_eq!(blobs.try_get("k").unwrap().data, b"v2");
}

#[test]
fn list_push_pop_and_prepend_deque_are_inverses() {
    let (_dir, db) = open_temp();
    let list = db.list("l").unwrap();

    list.push(&"x").unwrap();
    assert_eq!(list.pop::<String>().unwrap(), Some("x".to_string()));
    assert!(list.is_empty().unwrap());

    list.prepend(&"y").unwrap();
    assert_eq!(list.deque::<String>().unwrap(), Some("y".to_string()));
    assert!(list.is_empty().unwrap());
}

// ============================================================================
// Boundary cases
// ============================================================================

#[test]
fn list_insert_boundaries() {
    let (_dir, db) = open_temp();
    let list = db.list("bounds").unwrap();

    // Insert at <= 0 on an empty list behaves as prepend; at >= len as push.
    list.insert(-10, &"a").unwrap();
    list.insert(100, &"z").unwrap();
    list.insert(1, &"m").unwrap();

    let items: Vec<String> = list.iter().unwrap().collect();
    assert_eq!(items, ["a", "m", "z"]);
}

#[test]
fn lock_reacquire_and_unheld_release_are_noops() {
    let (_dir, db) = open_temp();
    let lock = db.lock("job", LockOptions::default()).unwrap();

    assert!(lock.acquire().unwrap());
    assert!(lock.acquire().unwrap());

    lock.release();
    lock.release();

    // Clearing a lock that no longer exists succeeds with nothing deleted.
    assert!(!lock.clear().unwrap());
}

#[test]
fn vector_top_k_beyond_count_returns_everything() {
    let (_dir, db) = open_temp();
    let coll = db.collection("v").unwrap();

    for (id, v) in [("a", vec![0.0]), ("b", vec![3.0])] {
        coll.index(
            &beaverdb::Document::new(json!({})).with_id(id).with_embedding(v),
            &beaverdb::IndexRequest::default(),
        )
        .unwrap();
    }

    let hits = coll.search(&[0.0], 50).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0.id, "a");
}

// ============================================================================
// Cross-thread behavior
// ============================================================================

#[test]
fn managers_are_shared_across_threads() {
    let (_dir, db) = open_temp();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let dict = db.dict("shared").unwrap();
            for i in 0..10 {
                dict.set(&format!("w{worker}:{i}"), &i, None).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.dict("shared").unwrap().len().unwrap(), 40);
}

#[test]
fn queue_consumers_never_duplicate_items() {
    let (_dir, db) = open_temp();
    let queue = db.queue("work").unwrap();
    for i in 0..20 {
        queue.put(&i, 1.0).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let queue = db.queue("work").unwrap();
            let mut taken = Vec::new();
            loop {
                match queue.try_get() {
                    Ok(item) => taken.push(item.data.as_i64().unwrap()),
                    Err(Error::Empty(_)) => return taken,
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }
        }));
    }

    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..20).collect::<Vec<i64>>());
}

// ============================================================================
// Cache-disabled operation
// ============================================================================

#[test]
fn writes_are_coherent_with_caching_disabled() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nocache.db");

    // Writer has caching off, reader on: the writer must still bump the
    // version registry so the reader's cache invalidates.
    let writer = Database::open_with(
        path.to_str().unwrap(),
        DatabaseOptions {
            enable_cache: false,
            ..DatabaseOptions::default()
        },
    )
    .unwrap();
    let reader = Database::open_with(
        path.to_str().unwrap(),
        DatabaseOptions {
            cache_check_interval: 0.05,
            ..DatabaseOptions::default()
        },
    )
    .unwrap();

    writer.dict("d").unwrap().set("k", &1, None).unwrap();
    assert_eq!(reader.dict("d").unwrap().get::<i64>("k").unwrap(), Some(1));

    writer.dict("d").unwrap().set("k", &2, None).unwrap();
    thread::sleep(Duration::from_millis(80));
    assert_eq!(reader.dict("d").unwrap().get::<i64>("k").unwrap(), Some(2));
}

// ============================================================================
// Live log tailing
// ============================================================================

#[test]
fn live_tail_streams_entries_in_order() {
    let (_dir, db) = open_temp();
    let log = db.log("stream").unwrap();
    let mut tail = log.live(0.01);

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let log = db.log("stream").unwrap();
            thread::sleep(Duration::from_millis(30));
            for i in 0..5 {
                log.append(&i, None).unwrap();
            }
        })
    };

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(tail.next().unwrap().unwrap().data.as_i64().unwrap());
    }
    assert_eq!(seen, [0, 1, 2, 3, 4]);
    writer.join().unwrap();
}

// ============================================================================
// Sketches
// ============================================================================

#[test]
fn sketch_tracks_membership_and_cardinality_across_handles() {
    let (dir, db) = open_temp();
    let sketch = db.sketch_with("visitors", 10_000, 0.01).unwrap();

    let visitors: Vec<String> = (0..500).map(|i| format!("user-{i}")).collect();
    sketch.add_many(&visitors).unwrap();

    assert!(sketch.contains(&"user-42").unwrap());
    let estimate = sketch.count().unwrap();
    assert!((450..=550).contains(&estimate), "estimate {estimate}");

    // Another handle on the same file converges on the same state.
    let other_db = Database::open(dir.path().join("managers.db").to_str().unwrap()).unwrap();
    let other = other_db.sketch_with("visitors", 10_000, 0.01).unwrap();
    assert!(other.contains(&"user-499").unwrap());

    // A third handle reopening with different sizing is rejected: the
    // binary layout depends on the original parameters.
    let third_db = Database::open(dir.path().join("managers.db").to_str().unwrap()).unwrap();
    assert!(matches!(
        third_db.sketch_with("visitors", 99, 0.5),
        Err(Error::InvalidArgument(_))
    ));

    assert_eq!(db.sketches().unwrap(), vec!["visitors".to_string()]);
}

// ============================================================================
// Lock TTL recovery across handles
// ============================================================================

#[test]
fn crashed_holder_is_reclaimed_after_ttl() {
    let (dir, _db) = open_temp();
    let path = dir.path().join("managers.db");

    // "Crashed" holder: acquires with a short TTL and never releases.
    let crashed = Database::open(path.to_str().unwrap()).unwrap();
    let stale = crashed
        .lock(
            "critical",
            LockOptions {
                timeout: None,
                lock_ttl: 0.2,
                poll_interval: 0.01,
            },
        )
        .unwrap();
    assert!(stale.acquire().unwrap());

    let successor_db = Database::open(path.to_str().unwrap()).unwrap();
    let successor = successor_db
        .lock(
            "critical",
            LockOptions {
                timeout: Some(5.0),
                lock_ttl: 10.0,
                poll_interval: 0.01,
            },
        )
        .unwrap();

    // Blocks until the stale lease expires, then wins.
    assert!(successor.acquire().unwrap());
    successor.release();
}
