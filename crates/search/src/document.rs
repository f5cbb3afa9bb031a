//! Document container and field flattening
//!
//! A document is an id, an optional embedding, and a JSON metadata body.
//! For indexing, the body's string leaves are flattened into
//! `(field_path, content)` pairs using `.` as the path separator
//! (`user.address.city`). Strings inside arrays flatten to the array's own
//! path; non-string leaves are skipped.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use beaver_core::Result;

/// A single item in a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Unique id within the collection; a fresh UUID unless supplied.
    pub id: String,
    /// Optional embedding vector, serialized as little-endian f32 bytes.
    pub embedding: Option<Vec<f32>>,
    /// Arbitrary JSON metadata; the searchable body of the document.
    pub metadata: Value,
}

impl Document {
    /// Create a document with a fresh UUID id.
    pub fn new(metadata: Value) -> Self {
        Document {
            id: uuid::Uuid::new_v4().simple().to_string(),
            embedding: None,
            metadata,
        }
    }

    /// Create a document from a typed, serializable body.
    pub fn from_body<T: Serialize>(body: &T) -> Result<Self> {
        Ok(Document::new(serde_json::to_value(body)?))
    }

    /// Builder: set the id.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Builder: set the embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Deserialize the metadata into a typed body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.metadata.clone())?)
    }
}

/// Path separator for flattened fields.
pub const FIELD_SEPARATOR: &str = ".";

/// Flatten all string leaves of `value` into `(field_path, content)` pairs.
///
/// Blank strings are skipped; they carry nothing searchable.
pub fn flatten_strings(value: &Value) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    flatten_into(value, "", &mut fields);
    fields
}

fn flatten_into(value: &Value, prefix: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}{FIELD_SEPARATOR}{key}")
                };
                flatten_into(child, &path, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                match child {
                    Value::Object(_) | Value::Array(_) => flatten_into(child, prefix, out),
                    Value::String(s) if !s.trim().is_empty() => {
                        out.push((prefix.to_string(), s.clone()));
                    }
                    _ => {}
                }
            }
        }
        Value::String(s) if !s.trim().is_empty() => {
            out.push((prefix.to_string(), s.clone()));
        }
        _ => {}
    }
}

/// Lowercased length-3 windows of `text`, deduplicated in first-seen order.
pub fn trigrams(text: &str) -> Vec<String> {
    let lowered: Vec<char> = text.to_lowercase().chars().collect();
    if lowered.len() < 3 {
        return Vec::new();
    }

    let mut seen = std::collections::HashSet::new();
    let mut grams = Vec::new();
    for window in lowered.windows(3) {
        let gram: String = window.iter().collect();
        if seen.insert(gram.clone()) {
            grams.push(gram);
        }
    }
    grams
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_documents_get_unique_ids() {
        let a = Document::new(json!({}));
        let b = Document::new(json!({}));
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_empty());
    }

    #[test]
    fn flatten_nested_objects() {
        let fields = flatten_strings(&json!({
            "title": "intro",
            "user": {"name": "ada", "age": 36},
            "tags": ["rust", "db", 7],
        }));

        assert!(fields.contains(&("title".to_string(), "intro".to_string())));
        assert!(fields.contains(&("user.name".to_string(), "ada".to_string())));
        assert!(fields.contains(&("tags".to_string(), "rust".to_string())));
        assert!(fields.contains(&("tags".to_string(), "db".to_string())));
        // Numbers are not searchable content.
        assert!(!fields.iter().any(|(path, _)| path == "user.age"));
    }

    #[test]
    fn flatten_skips_blank_strings() {
        let fields = flatten_strings(&json!({"a": "  ", "b": "x"}));
        assert_eq!(fields, vec![("b".to_string(), "x".to_string())]);
    }

    #[test]
    fn trigram_windows() {
        assert_eq!(trigrams("Python"), ["pyt", "yth", "tho", "hon"]);
        assert!(trigrams("ab").is_empty());
        // Duplicates collapse.
        assert_eq!(trigrams("aaaa"), ["aaa"]);
    }

    #[test]
    fn typed_body_round_trip() {
        #[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
        struct Article {
            title: String,
        }

        let doc = Document::from_body(&Article {
            title: "hello".into(),
        })
        .unwrap();
        assert_eq!(
            doc.body::<Article>().unwrap(),
            Article {
                title: "hello".into()
            }
        );
    }
}
