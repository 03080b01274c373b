//! Test doubles shared by unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::database::memory::MemoryIndex;
use crate::database::{IndexedDocument, ScoreOrder, ScoredDocument, VectorIndex};
use crate::embeddings::Embedder;
use crate::records::{Document, DocumentMetadata};
use crate::{RecallError, Result};

pub fn document(sender: Option<&str>, body: &str, time: Option<&str>) -> Document {
    Document {
        content: format!("聊天记录:\n内容: {body}"),
        metadata: DocumentMetadata {
            source: "test.csv".to_string(),
            chat_time: time.map(str::to_string),
            sender: sender.map(str::to_string),
            msg_type: Some("文本".to_string()),
            room: None,
            is_sender: false,
            msg_content_preview: body.to_string(),
        },
    }
}

pub fn documents(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| document(Some("alice"), &format!("message number {i}"), None))
        .collect()
}

/// Deterministic bag-of-characters embedding
pub fn vector_for(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0_f32; 8];
    for c in text.chars() {
        vector[(c as usize) % 8] += 1.0;
    }
    vector
}

/// Embedder that fails a set number of times, then succeeds.
pub struct StubEmbedder {
    calls: AtomicUsize,
    failures_remaining: AtomicUsize,
    failure: fn() -> RecallError,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::failing(0, || RecallError::Network("unused".to_string()))
    }

    pub fn failing(times: usize, failure: fn() -> RecallError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(times),
            failure,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RecallError::Embedding("no vector".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err((self.failure)());
        }
        Ok(texts.iter().map(|t| vector_for(t)).collect())
    }
}

/// Memory index that records upsert calls and rejects batches containing a marker.
pub struct RecordingIndex {
    inner: MemoryIndex,
    poison: Option<String>,
    pub upsert_sizes: Mutex<Vec<usize>>,
    pub upsert_first_contents: Mutex<Vec<String>>,
    pub upsert_attempts: AtomicUsize,
}

impl RecordingIndex {
    pub fn new() -> Self {
        Self {
            inner: MemoryIndex::new("recording", ScoreOrder::HigherIsBetter),
            poison: None,
            upsert_sizes: Mutex::new(Vec::new()),
            upsert_first_contents: Mutex::new(Vec::new()),
            upsert_attempts: AtomicUsize::new(0),
        }
    }

    pub fn poisoned_by(marker: &str) -> Self {
        Self {
            poison: Some(marker.to_string()),
            ..Self::new()
        }
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.upsert_sizes.lock().expect("lock should not be poisoned").clone()
    }
}

#[async_trait]
impl VectorIndex for RecordingIndex {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn score_order(&self) -> ScoreOrder {
        self.inner.score_order()
    }

    async fn upsert(&self, records: &[IndexedDocument]) -> Result<()> {
        self.upsert_attempts.fetch_add(1, Ordering::SeqCst);
        let poisoned = self
            .poison
            .as_deref()
            .is_some_and(|marker| records.iter().any(|r| r.document.content.contains(marker)));
        if poisoned {
            return Err(RecallError::Database("poisoned batch".to_string()));
        }

        self.upsert_sizes
            .lock()
            .expect("lock should not be poisoned")
            .push(records.len());
        if let Some(first) = records.first() {
            self.upsert_first_contents
                .lock()
                .expect("lock should not be poisoned")
                .push(first.document.content.clone());
        }
        self.inner.upsert(records).await
    }

    async fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>> {
        self.inner.knn_search(vector, k).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn sample(&self, limit: usize) -> Result<Vec<Document>> {
        self.inner.sample(limit).await
    }
}

/// Index returning canned search results, for query and stats tests.
pub struct CannedIndex {
    pub order: ScoreOrder,
    pub results: Vec<ScoredDocument>,
    pub stored: Vec<Document>,
    pub count_fails: bool,
    pub search_failures: AtomicUsize,
    pub search_failure: fn() -> RecallError,
    pub searches: AtomicUsize,
    pub sampled_limits: Mutex<Vec<usize>>,
}

impl CannedIndex {
    pub fn with_scores(order: ScoreOrder, scores: &[f32]) -> Self {
        let results = scores
            .iter()
            .enumerate()
            .map(|(i, &score)| ScoredDocument {
                document: document(Some("alice"), &format!("result {i}"), None),
                score,
            })
            .collect();
        Self {
            results,
            ..Self::storing(order, Vec::new())
        }
    }

    pub fn storing(order: ScoreOrder, stored: Vec<Document>) -> Self {
        Self {
            order,
            results: Vec::new(),
            stored,
            count_fails: false,
            search_failures: AtomicUsize::new(0),
            search_failure: || RecallError::Network("unused".to_string()),
            searches: AtomicUsize::new(0),
            sampled_limits: Mutex::new(Vec::new()),
        }
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for CannedIndex {
    fn name(&self) -> &str {
        "canned"
    }

    fn score_order(&self) -> ScoreOrder {
        self.order
    }

    async fn upsert(&self, _records: &[IndexedDocument]) -> Result<()> {
        Err(RecallError::Database("read-only test index".to_string()))
    }

    async fn knn_search(&self, _vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .search_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err((self.search_failure)());
        }
        Ok(self.results.iter().take(k).cloned().collect())
    }

    async fn count(&self) -> Result<usize> {
        if self.count_fails {
            return Err(RecallError::Database("count unsupported".to_string()));
        }
        Ok(self.stored.len())
    }

    async fn sample(&self, limit: usize) -> Result<Vec<Document>> {
        self.sampled_limits
            .lock()
            .expect("lock should not be poisoned")
            .push(limit);
        Ok(self.stored.iter().take(limit).cloned().collect())
    }
}
