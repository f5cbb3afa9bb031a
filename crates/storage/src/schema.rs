//! On-disk schema bootstrap
//!
//! Creates every table, index, and virtual table idempotently. The names
//! here are normative: they appear on disk and are shared by every process
//! that opens the same file, so they must never drift.
//!
//! Layout:
//! - `beaver_dicts` / `beaver_lists` / `beaver_priority_queues` /
//!   `beaver_blobs` / `beaver_logs` / `beaver_pubsub_log`: the simple
//!   data-structure managers
//! - `beaver_collections` + `beaver_fts_index` + `beaver_trigrams` +
//!   `beaver_edges`: the document collection fan-out
//! - `beaver_sketches`: packed HyperLogLog + Bloom filter blobs
//! - `beaver_manager_versions`: monotonic counters driving cache coherence
//! - `beaver_collection_versions`: vector-index base versions, bumped by
//!   compaction only
//! - `beaver_lock_waiters`: the FIFO queue of the inter-process lock manager
//! - `_vector_change_log`: append-only record of vector inserts/deletes

use beaver_core::Result;
use rusqlite::Connection;

/// Create all tables and indexes if they do not exist yet.
pub fn create_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS beaver_dicts (
            dict_name TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            expires_at REAL,
            PRIMARY KEY (dict_name, key)
        );

        CREATE TABLE IF NOT EXISTS beaver_lists (
            list_name TEXT NOT NULL,
            item_order REAL NOT NULL,
            item_value TEXT NOT NULL,
            PRIMARY KEY (list_name, item_order)
        );

        CREATE TABLE IF NOT EXISTS beaver_priority_queues (
            queue_name TEXT NOT NULL,
            priority REAL NOT NULL,
            timestamp REAL NOT NULL,
            data TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_priority_queue_order
            ON beaver_priority_queues (queue_name, priority ASC, timestamp ASC);

        CREATE TABLE IF NOT EXISTS beaver_blobs (
            store_name TEXT NOT NULL,
            key TEXT NOT NULL,
            data BLOB NOT NULL,
            metadata TEXT,
            PRIMARY KEY (store_name, key)
        );

        CREATE TABLE IF NOT EXISTS beaver_logs (
            log_name TEXT NOT NULL,
            timestamp REAL NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (log_name, timestamp)
        );
        CREATE INDEX IF NOT EXISTS idx_logs_timestamp
            ON beaver_logs (log_name, timestamp);

        CREATE TABLE IF NOT EXISTS beaver_pubsub_log (
            timestamp REAL PRIMARY KEY,
            channel_name TEXT NOT NULL,
            message_payload TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pubsub_channel_timestamp
            ON beaver_pubsub_log (channel_name, timestamp);

        CREATE TABLE IF NOT EXISTS beaver_collections (
            collection TEXT NOT NULL,
            item_id TEXT NOT NULL,
            item_vector BLOB,
            metadata TEXT,
            PRIMARY KEY (collection, item_id)
        );

        CREATE TABLE IF NOT EXISTS beaver_trigrams (
            collection TEXT NOT NULL,
            item_id TEXT NOT NULL,
            field_path TEXT NOT NULL,
            trigram TEXT NOT NULL,
            PRIMARY KEY (collection, field_path, trigram, item_id)
        );
        CREATE INDEX IF NOT EXISTS idx_trigram_lookup
            ON beaver_trigrams (collection, trigram, field_path);

        CREATE TABLE IF NOT EXISTS beaver_edges (
            collection TEXT NOT NULL,
            source_item_id TEXT NOT NULL,
            target_item_id TEXT NOT NULL,
            label TEXT NOT NULL,
            metadata TEXT,
            PRIMARY KEY (collection, source_item_id, target_item_id, label)
        );

        CREATE TABLE IF NOT EXISTS beaver_collection_versions (
            collection_name TEXT PRIMARY KEY,
            base_version INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS beaver_manager_versions (
            namespace TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS beaver_sketches (
            name TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            capacity INTEGER NOT NULL,
            error_rate REAL NOT NULL,
            data BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS beaver_lock_waiters (
            lock_name TEXT NOT NULL,
            waiter_id TEXT NOT NULL,
            requested_at REAL NOT NULL,
            expires_at REAL NOT NULL,
            PRIMARY KEY (lock_name, requested_at)
        );
        CREATE INDEX IF NOT EXISTS idx_lock_expires
            ON beaver_lock_waiters (lock_name, expires_at);
        CREATE INDEX IF NOT EXISTS idx_lock_waiter_id
            ON beaver_lock_waiters (lock_name, waiter_id);

        CREATE TABLE IF NOT EXISTS _vector_change_log (
            log_id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_name TEXT NOT NULL,
            item_id TEXT NOT NULL,
            operation_type INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_vcl_lookup
            ON _vector_change_log (collection_name, log_id);
        "#,
    )?;

    // The FTS virtual table cannot go through execute_batch with IF NOT
    // EXISTS on older SQLite builds bundled without error, so it gets its
    // own statement.
    conn.execute_batch(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS beaver_fts_index USING fts5(
            collection,
            item_id,
            field_path,
            field_content,
            tokenize = 'porter'
        );
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();
        create_all_tables(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE 'beaver%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(count >= 12);
    }

    #[test]
    fn fts_table_accepts_rows() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();
        conn.execute(
            "INSERT INTO beaver_fts_index (collection, item_id, field_path, field_content)
             VALUES ('c', 'x', 'title', 'running quickly')",
            [],
        )
        .unwrap();
        // Porter stemming: 'run' matches 'running'.
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM beaver_fts_index WHERE beaver_fts_index MATCH 'run'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
