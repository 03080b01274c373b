//! In-memory collections for tests and dry runs.
//!
//! Search is brute-force cosine similarity over every stored vector.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{
    CollectionStore, IndexedDocument, ScoreOrder, ScoredDocument, VectorIndex,
    check_collection_name, is_valid_collection_name,
};
use crate::records::Document;
use crate::{RecallError, Result};

fn poisoned<T>(_: T) -> RecallError {
    RecallError::Database("in-memory index lock poisoned".to_string())
}

pub struct MemoryIndex {
    name: String,
    order: ScoreOrder,
    rows: RwLock<Vec<IndexedDocument>>,
}

impl MemoryIndex {
    #[inline]
    pub fn new(name: &str, order: ScoreOrder) -> Self {
        Self {
            name: name.to_string(),
            order,
            rows: RwLock::new(Vec::new()),
        }
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn score_order(&self) -> ScoreOrder {
        self.order
    }

    async fn upsert(&self, records: &[IndexedDocument]) -> Result<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        rows.extend_from_slice(records);
        Ok(())
    }

    async fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut scored: Vec<(f32, &IndexedDocument)> = rows
            .iter()
            .map(|row| (1.0 - cosine_sim(vector, &row.vector), row))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(distance, row)| ScoredDocument {
                document: row.document.clone(),
                score: self.order.from_distance(distance),
            })
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().map_err(poisoned)?.len())
    }

    async fn sample(&self, limit: usize) -> Result<Vec<Document>> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.iter().take(limit).map(|r| r.document.clone()).collect())
    }
}

/// Named [`MemoryIndex`] collections. Contents vanish with the value.
pub struct MemoryCollections {
    order: ScoreOrder,
    collections: RwLock<HashMap<String, Arc<MemoryIndex>>>,
}

impl MemoryCollections {
    #[inline]
    pub fn new(order: ScoreOrder) -> Self {
        Self {
            order,
            collections: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CollectionStore for MemoryCollections {
    async fn open(&self, name: &str) -> Result<Arc<dyn VectorIndex>> {
        check_collection_name(name)?;
        let collections = self.collections.read().map_err(poisoned)?;
        collections
            .get(name)
            .map(|index| Arc::clone(index) as Arc<dyn VectorIndex>)
            .ok_or_else(|| RecallError::IndexUnavailable(format!("collection '{name}' does not exist")))
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn VectorIndex>> {
        check_collection_name(name)?;
        let index = Arc::new(MemoryIndex::new(name, self.order));
        self.collections
            .write()
            .map_err(poisoned)?
            .insert(name.to_string(), Arc::clone(&index));
        Ok(index)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        check_collection_name(name)?;
        Ok(self
            .collections
            .write()
            .map_err(poisoned)?
            .remove(name)
            .is_some())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        check_collection_name(name)?;
        Ok(self.collections.read().map_err(poisoned)?.contains_key(name))
    }

    async fn replace(&self, source: &str, target: &str) -> Result<()> {
        check_collection_name(source)?;
        check_collection_name(target)?;
        let mut collections = self.collections.write().map_err(poisoned)?;
        let index = collections
            .remove(source)
            .ok_or_else(|| RecallError::IndexUnavailable(format!("collection '{source}' does not exist")))?;
        collections.insert(target.to_string(), index);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let mut names: Vec<String> = collections
            .keys()
            .filter(|name| is_valid_collection_name(name))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}
