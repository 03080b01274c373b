// Database module
// Named vector collections: a LanceDB backend for real use and an in-memory one for tests

pub mod lancedb;
pub mod memory;


use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::records::Document;
use crate::{RecallError, Result};

/// Suffix of the collection a staged rebuild writes into
pub const STAGING_SUFFIX: &str = ".staging";

/// Direction of the scores a [`VectorIndex`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreOrder {
    /// Similarity: `1 - cosine distance`
    #[serde(rename = "similarity")]
    HigherIsBetter,
    /// Raw cosine distance
    #[serde(rename = "distance")]
    LowerIsBetter,
}

impl ScoreOrder {
    /// Whether `score` is at least as good as `threshold`.
    #[inline]
    pub fn passes(self, score: f32, threshold: f32) -> bool {
        match self {
            Self::HigherIsBetter => score >= threshold,
            Self::LowerIsBetter => score <= threshold,
        }
    }

    /// Convert a cosine distance into a score in this order.
    #[inline]
    pub fn from_distance(self, distance: f32) -> f32 {
        match self {
            Self::HigherIsBetter => 1.0 - distance,
            Self::LowerIsBetter => distance,
        }
    }
}

impl fmt::Display for ScoreOrder {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HigherIsBetter => "similarity",
            Self::LowerIsBetter => "distance",
        })
    }
}

/// A document paired with its embedding, as written to an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub id: String,
    pub vector: Vec<f32>,
    pub document: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// One named, searchable collection of documents.
///
/// All methods take `&self`; implementations must tolerate concurrent searches.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    fn score_order(&self) -> ScoreOrder;

    async fn upsert(&self, records: &[IndexedDocument]) -> Result<()>;

    /// Up to `k` nearest documents, best first.
    async fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>>;

    async fn count(&self) -> Result<usize>;

    /// Up to `limit` stored documents in no particular order.
    async fn sample(&self, limit: usize) -> Result<Vec<Document>>;
}

/// Manages the set of named collections.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Open an existing collection, failing with [`RecallError::IndexUnavailable`] if missing.
    async fn open(&self, name: &str) -> Result<Arc<dyn VectorIndex>>;

    /// Create an empty collection, discarding any existing one with that name.
    async fn create(&self, name: &str) -> Result<Arc<dyn VectorIndex>>;

    /// Returns whether anything was deleted.
    async fn delete(&self, name: &str) -> Result<bool>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Make `source` visible under `target`, dropping the previous `target`.
    async fn replace(&self, source: &str, target: &str) -> Result<()>;

    /// User-visible collection names, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Letters, digits, `-` and `_`.
#[inline]
pub fn is_valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[inline]
pub fn staging_name(name: &str) -> String {
    format!("{name}{STAGING_SUFFIX}")
}

/// Accept user names and their staging counterparts.
pub(crate) fn check_collection_name(name: &str) -> Result<()> {
    let base = name.strip_suffix(STAGING_SUFFIX).unwrap_or(name);
    if is_valid_collection_name(base) {
        Ok(())
    } else {
        Err(RecallError::Config(format!(
            "invalid collection name {name:?}: use letters, digits, '-' and '_'"
        )))
    }
}
