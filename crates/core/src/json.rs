//! JSON round-trip helpers
//!
//! All value payloads (dict values, list items, queue data, log entries,
//! channel messages, document metadata) are stored as JSON TEXT columns.
//! These helpers centralize the serde plumbing so every manager converts
//! values the same way and surfaces the same error kind on failure.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Serialize a value to the JSON string stored in a TEXT column.
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize a TEXT column back into a caller-chosen type.
///
/// Callers that do not care about typing use `serde_json::Value`.
pub fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Task {
        title: String,
        done: bool,
    }

    #[test]
    fn typed_round_trip() {
        let task = Task {
            title: "write docs".into(),
            done: false,
        };
        let raw = to_json(&task).unwrap();
        let back: Task = from_json(&raw).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn untyped_round_trip() {
        let raw = to_json(&serde_json::json!({"a": [1, 2, 3]})).unwrap();
        let back: serde_json::Value = from_json(&raw).unwrap();
        assert_eq!(back["a"][2], 3);
    }
}
