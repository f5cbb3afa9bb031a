//! End-to-end scenarios over the public `beaverdb` surface
//!
//! Each test exercises a documented contract through the `Database` facade,
//! several of them with two handles on the same file standing in for two
//! cooperating processes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use beaverdb::{
    rerank, Database, DatabaseOptions, Direction, Document, Error, FtsMode, IndexRequest,
    LockOptions, MatchRequest,
};

/// Route `tracing` output through the test harness. Safe to call from
/// every test; only the first call installs the subscriber.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn open_temp() -> (TempDir, Database) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scenario.db");
    let db = Database::open(path.to_str().unwrap()).unwrap();
    (dir, db)
}

/// A second handle on the same file, standing in for another process.
fn reopen(dir: &TempDir) -> Database {
    let path = dir.path().join("scenario.db");
    Database::open(path.to_str().unwrap()).unwrap()
}

// ============================================================================
// Scenario 1: dict TTL
// ============================================================================

#[test]
fn dict_ttl_expires_and_purges() {
    let (_dir, db) = open_temp();
    let dict = db.dict("c").unwrap();

    dict.set("k", &"v", Some(0.5)).unwrap();
    assert_eq!(dict.get::<String>("k").unwrap(), Some("v".to_string()));

    thread::sleep(Duration::from_millis(600));

    assert!(matches!(
        dict.try_get::<String>("k"),
        Err(Error::KeyNotFound { .. })
    ));
    // The expired row is gone, not just hidden.
    assert_eq!(dict.len().unwrap(), 0);
}

// ============================================================================
// Scenario 2: priority queue FIFO among equals
// ============================================================================

#[test]
fn queue_serves_priority_then_insertion_order() {
    let (_dir, db) = open_temp();
    let queue = db.queue("jobs").unwrap();

    queue.put(&"a", 5.0).unwrap();
    thread::sleep(Duration::from_millis(2));
    queue.put(&"b", 5.0).unwrap();
    thread::sleep(Duration::from_millis(2));
    queue.put(&"c", 1.0).unwrap();

    assert_eq!(queue.try_get().unwrap().data, json!("c"));
    assert_eq!(queue.try_get().unwrap().data, json!("a"));
    assert_eq!(queue.try_get().unwrap().data, json!("b"));
    assert!(matches!(queue.try_get(), Err(Error::Empty(_))));
}

// ============================================================================
// Scenario 3: collection atomic upsert
// ============================================================================

#[test]
fn collection_upsert_is_visible_in_every_projection_and_drop_reverts() {
    let (_dir, db) = open_temp();
    let docs = db.collection("notes").unwrap();

    let doc = Document::new(json!({"content": "python is great"}))
        .with_id("x")
        .with_embedding(vec![0.1, 0.9]);
    docs.index(
        &doc,
        &IndexRequest {
            fts: FtsMode::All,
            fuzzy: true,
        },
    )
    .unwrap();

    // Fuzzy: a two-edit typo still finds the document.
    let fuzzy = docs
        .text_match(
            "pythn",
            &MatchRequest {
                fuzziness: 2,
                ..MatchRequest::default()
            },
        )
        .unwrap();
    assert_eq!(fuzzy.len(), 1);
    assert_eq!(fuzzy[0].0.id, "x");

    // Vector: the exact embedding is distance zero.
    let hits = docs.search(&[0.1, 0.9], 1).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.id, "x");
    assert_eq!(hits[0].1, 0.0);

    docs.remove("x").unwrap();

    assert!(docs
        .text_match(
            "pythn",
            &MatchRequest {
                fuzziness: 2,
                ..MatchRequest::default()
            }
        )
        .unwrap()
        .is_empty());
    assert!(docs.search(&[0.1, 0.9], 1).unwrap().is_empty());
}

// ============================================================================
// Scenario 4: graph walk
// ============================================================================

#[test]
fn walk_finds_documents_within_depth() {
    let (_dir, db) = open_temp();
    let docs = db.collection("social").unwrap();

    for name in ["alice", "bob", "charlie", "diana"] {
        docs.index(
            &Document::new(json!({"name": name})).with_id(name),
            &IndexRequest::default(),
        )
        .unwrap();
    }
    docs.connect("alice", "bob", "FOLLOWS", None).unwrap();
    docs.connect("alice", "charlie", "FOLLOWS", None).unwrap();
    docs.connect("bob", "diana", "FOLLOWS", None).unwrap();

    let reachable = docs
        .walk("alice", &["FOLLOWS"], 2, Direction::Outgoing)
        .unwrap();
    let mut names: Vec<String> = reachable.into_iter().map(|d| d.id).collect();
    names.sort();
    assert_eq!(names, ["bob", "charlie", "diana"]);
}

// ============================================================================
// Scenario 5: lock fairness
// ============================================================================

#[test]
fn lock_queue_is_served_in_fifo_order() {
    let (dir, db1) = open_temp();
    let db2 = reopen(&dir);
    let db3 = reopen(&dir);

    let quick = LockOptions {
        timeout: None,
        lock_ttl: 10.0,
        poll_interval: 0.01,
    };

    let p1 = db1.lock("L", quick.clone()).unwrap();
    assert!(p1.acquire().unwrap());

    // P2 enqueues, then P3.
    let p2 = Arc::new(db2.lock("L", quick.clone()).unwrap());
    let p3 = Arc::new(db3.lock("L", quick).unwrap());

    let p2_thread = thread::spawn({
        let p2 = Arc::clone(&p2);
        move || p2.acquire().unwrap()
    });
    thread::sleep(Duration::from_millis(60));
    let p3_thread = thread::spawn({
        let p3 = Arc::clone(&p3);
        move || p3.acquire().unwrap()
    });
    thread::sleep(Duration::from_millis(60));

    // P1 releases: P2 acquires while P3 keeps waiting.
    p1.release();
    assert!(p2_thread.join().unwrap());
    assert!(p2.is_acquired());
    assert!(!p3.is_acquired());

    // P2 releases: P3 acquires.
    p2.release();
    assert!(p3_thread.join().unwrap());
    assert!(p3.is_acquired());
    p3.release();
}

// ============================================================================
// Scenario 6: vector sync across handles
// ============================================================================

#[test]
fn vector_index_syncs_and_survives_compaction_across_handles() {
    let (dir, db_a) = open_temp();
    let db_b = reopen(&dir);

    let coll_a = db_a.collection("vecs").unwrap();
    let coll_b = db_b.collection("vecs").unwrap();

    // Process A inserts v1.
    coll_a
        .index(
            &Document::new(json!({})).with_id("v1").with_embedding(vec![1.0, 0.0]),
            &IndexRequest::default(),
        )
        .unwrap();

    // Process B's next search picks it up through the change-log.
    let hits = coll_b.search(&[1.0, 0.0], 1).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.id, "v1");

    // A compacts; B observes the base-version bump, reloads, and still
    // finds v1.
    coll_a.compact().unwrap();
    let hits = coll_b.search(&[1.0, 0.0], 1).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.id, "v1");
    assert_eq!(coll_b.vector_index().delta_size(), 0);
}

// ============================================================================
// Cache coherence across handles
// ============================================================================

#[test]
fn reader_observes_writes_after_check_interval() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scenario.db");
    let options = DatabaseOptions {
        cache_check_interval: 0.05,
        ..DatabaseOptions::default()
    };
    let writer = Database::open_with(path.to_str().unwrap(), options.clone()).unwrap();
    let reader = Database::open_with(path.to_str().unwrap(), options).unwrap();

    writer.dict("shared").unwrap().set("k", &1, None).unwrap();
    // Warm the reader's cache.
    assert_eq!(reader.dict("shared").unwrap().get::<i64>("k").unwrap(), Some(1));

    writer.dict("shared").unwrap().set("k", &2, None).unwrap();

    // After the check interval elapses the reader must see the new value.
    thread::sleep(Duration::from_millis(80));
    assert_eq!(reader.dict("shared").unwrap().get::<i64>("k").unwrap(), Some(2));
}

// ============================================================================
// Log monotonicity
// ============================================================================

#[test]
fn log_timestamps_are_strictly_increasing() {
    let (_dir, db) = open_temp();
    let log = db.log("audit").unwrap();

    let mut previous = f64::MIN;
    for i in 0..50 {
        let ts = log.append(&i, None).unwrap();
        assert!(ts > previous, "timestamp {ts} not after {previous}");
        previous = ts;
    }
    assert_eq!(log.count().unwrap(), 50);
}

// ============================================================================
// Pub/sub across handles
// ============================================================================

#[test]
fn channel_delivers_across_handles_and_close_stops_subscribers() {
    let (dir, db_pub) = open_temp();
    let db_sub = reopen(&dir);

    let mut subscriber = db_sub.channel("events").unwrap().subscribe(0.01);

    let publisher = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        db_pub
            .channel("events")
            .unwrap()
            .publish(&json!({"n": 1}))
            .unwrap();
    });

    let message = subscriber.next().unwrap().unwrap();
    assert_eq!(message.payload, json!({"n": 1}));
    publisher.join().unwrap();

    db_sub.close();
    assert!(subscriber.next().is_none());
}

// ============================================================================
// Hybrid rerank
// ============================================================================

#[test]
fn rerank_fuses_text_and_vector_results() {
    let (_dir, db) = open_temp();
    let docs = db.collection("hybrid").unwrap();

    for (id, text, vector) in [
        ("a", "rust database engine", vec![1.0, 0.0]),
        ("b", "cooking with rust-colored pots", vec![0.0, 1.0]),
        ("c", "databases in rust", vec![0.9, 0.1]),
    ] {
        docs.index(
            &Document::new(json!({"text": text}))
                .with_id(id)
                .with_embedding(vector),
            &IndexRequest::default(),
        )
        .unwrap();
    }

    let text_hits: Vec<Document> = docs
        .text_match("database", &MatchRequest::default())
        .unwrap()
        .into_iter()
        .map(|(doc, _)| doc)
        .collect();
    let vector_hits: Vec<Document> = docs
        .search(&[1.0, 0.0], 3)
        .unwrap()
        .into_iter()
        .map(|(doc, _)| doc)
        .collect();

    let fused = rerank(&[text_hits.clone(), vector_hits], None, 60.0).unwrap();
    assert!(!fused.is_empty());
    // 'a' leads the vector list and appears in the text list.
    assert_eq!(fused[0].id, "a");

    // Single-list fusion preserves the original order.
    let single = rerank(&[text_hits.clone()], None, 60.0).unwrap();
    let original: Vec<&str> = text_hits.iter().map(|d| d.id.as_str()).collect();
    let fused_ids: Vec<&str> = single.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(fused_ids, original);
}

// ============================================================================
// Blocking queue across threads
// ============================================================================

#[test]
fn blocking_consumer_wakes_on_producer() {
    let (dir, db) = open_temp();
    let producer_db = reopen(&dir);

    let consumer = thread::spawn(move || db.queue("work").unwrap().get(Some(5.0)).unwrap());

    thread::sleep(Duration::from_millis(80));
    producer_db
        .queue("work")
        .unwrap()
        .put(&"payload", 1.0)
        .unwrap();

    let item = consumer.join().unwrap();
    assert_eq!(item.data, json!("payload"));
}
