//! Graph traversal over the edge store
//!
//! Edges are rows in `beaver_edges`; traversal is a breadth-first walk
//! expressed as a recursive CTE so the whole expansion happens in one
//! statement against the substrate.

/// Which way to follow edges during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow edges from source to target.
    Outgoing,
    /// Follow edges from target back to source.
    Incoming,
}

/// Build the recursive BFS statement for a walk.
///
/// Parameter order: seed item id, collection (edge expansion), depth bound,
/// the `label_count` labels, then collection again for the final document
/// join. Rows at `current_depth = 0` (the seed) are filtered by the caller.
pub fn walk_sql(direction: Direction, label_count: usize) -> String {
    let (from_col, to_col) = match direction {
        Direction::Outgoing => ("source_item_id", "target_item_id"),
        Direction::Incoming => ("target_item_id", "source_item_id"),
    };
    let label_placeholders = vec!["?"; label_count].join(",");

    format!(
        "WITH RECURSIVE walk_bfs(item_id, current_depth) AS (
             SELECT ?, 0
             UNION ALL
             SELECT edges.{to_col}, bfs.current_depth + 1
             FROM beaver_edges AS edges
             JOIN walk_bfs AS bfs ON edges.{from_col} = bfs.item_id
             WHERE edges.collection = ?
               AND bfs.current_depth < ?
               AND edges.label IN ({label_placeholders})
         )
         SELECT DISTINCT t1.item_id, t1.item_vector, t1.metadata
         FROM beaver_collections AS t1
         JOIN walk_bfs AS bfs ON t1.item_id = bfs.item_id
         WHERE t1.collection = ? AND bfs.current_depth > 0"
    )
}
