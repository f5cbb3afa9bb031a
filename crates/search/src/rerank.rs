//! Reciprocal-rank fusion for combining result lists
//!
//! Given several ranked lists of documents (from FTS, fuzzy, and vector
//! search), each document accumulates `weight * 1 / (k + rank)` per list it
//! appears in. Higher fused score wins; the first occurrence of a document
//! is the instance returned.

use std::collections::HashMap;

use beaver_core::{Error, Result};

use crate::document::Document;

/// Fuse ranked result lists into one, best first.
///
/// `weights` must match `lists` in length when given; all lists weigh 1.0
/// otherwise. `k` dampens the contribution of deep ranks (60 is the
/// conventional default).
pub fn rerank(lists: &[Vec<Document>], weights: Option<&[f64]>, k: f64) -> Result<Vec<Document>> {
    if lists.is_empty() {
        return Ok(Vec::new());
    }

    let default_weights;
    let weights = match weights {
        Some(weights) => {
            if weights.len() != lists.len() {
                return Err(Error::InvalidArgument(format!(
                    "got {} result lists but {} weights",
                    lists.len(),
                    weights.len()
                )));
            }
            weights
        }
        None => {
            default_weights = vec![1.0; lists.len()];
            &default_weights
        }
    };

    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut store: HashMap<String, Document> = HashMap::new();

    for (list, weight) in lists.iter().zip(weights.iter()) {
        for (rank, doc) in list.iter().enumerate() {
            if !store.contains_key(&doc.id) {
                order.push(doc.id.clone());
                store.insert(doc.id.clone(), doc.clone());
            }
            *scores.entry(doc.id.clone()).or_insert(0.0) += weight * (1.0 / (k + rank as f64));
        }
    }

    // Stable sort: equal scores keep first-seen order.
    order.sort_by(|a, b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(order
        .into_iter()
        .filter_map(|id| store.remove(&id))
        .collect())
}
