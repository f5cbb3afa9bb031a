//! Version registry
//!
//! One row per namespace in `beaver_manager_versions`, bumped by a single
//! atomic upsert. Local caches compare their remembered version against this
//! table to decide whether to discard themselves; because the bump is one
//! statement, the new value is observable by every other process the moment
//! the enclosing transaction commits.

use beaver_core::Result;
use rusqlite::{Connection, OptionalExtension};

/// Increment the counter for `namespace`, inserting it at 1 on first touch.
/// Returns the new value.
pub fn bump(conn: &Connection, namespace: &str) -> Result<u64> {
    let version: i64 = conn.query_row(
        "INSERT INTO beaver_manager_versions (namespace, version) VALUES (?1, 1)
         ON CONFLICT(namespace) DO UPDATE SET version = version + 1
         RETURNING version",
        [namespace],
        |row| row.get(0),
    )?;
    Ok(version as u64)
}

/// Read the counter for `namespace`. A missing record reads as 0.
pub fn read(conn: &Connection, namespace: &str) -> Result<u64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM beaver_manager_versions WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn first_touch_inserts_one() {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_all_tables(&conn).unwrap();

        assert_eq!(read(&conn, "queue:jobs").unwrap(), 0);
        assert_eq!(bump(&conn, "queue:jobs").unwrap(), 1);
        assert_eq!(bump(&conn, "queue:jobs").unwrap(), 2);
        assert_eq!(read(&conn, "queue:jobs").unwrap(), 2);
    }
}
