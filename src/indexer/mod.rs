// Indexer module
// Batches normalized documents through the embedder into a collection

pub mod retry;

#[cfg(test)]
mod tests;

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{StreamExt, stream};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::database::{
    CollectionStore, IndexedDocument, VectorIndex, is_valid_collection_name, staging_name,
};
use crate::embeddings::Embedder;
use crate::records::Document;
use crate::{RecallError, Result};

pub use retry::{Backoff, RetryOn, RetryOutcome, RetryPolicy};

/// How a rebuild treats the collection it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStrategy {
    /// Build into a staging collection and swap it in once something was indexed
    #[default]
    Staged,
    /// Delete the existing collection before ingesting
    InPlace,
}

impl fmt::Display for RebuildStrategy {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Staged => "staged",
            Self::InPlace => "in_place",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    pub batch_size: usize,
    /// Batches in flight at once
    pub concurrency: usize,
    /// Sleep after every batch
    pub pacing: Duration,
    /// Log a progress line every N batches
    pub progress_interval: usize,
}

impl Default for IngestOptions {
    #[inline]
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

impl IngestOptions {
    #[inline]
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            pacing: Duration::from_millis(config.pacing_ms),
            progress_interval: config.progress_interval.max(1),
        }
    }
}

/// Live counters for an ingestion run. Values only ever grow.
#[derive(Debug, Default)]
pub struct IngestProgress {
    processed_documents: AtomicUsize,
    completed_batches: AtomicUsize,
    failed_batches: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub processed_documents: usize,
    pub completed_batches: usize,
    pub failed_batches: usize,
}

impl IngestProgress {
    #[inline]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed_documents: self.processed_documents.load(Ordering::Relaxed),
            completed_batches: self.completed_batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub total_documents: usize,
    pub batches: usize,
    /// Documents whose batch was upserted
    pub succeeded: usize,
    pub failed_batches: usize,
    pub failed_documents: usize,
    /// Zero-based indices of batches that exhausted their attempts
    pub failed_batch_indices: Vec<usize>,
    /// Attempts across all batches
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub collection: String,
    pub strategy: RebuildStrategy,
    pub ingest: IngestReport,
    /// An earlier collection with this name was removed
    pub replaced_existing: bool,
    /// The new contents are live under `collection`
    pub committed: bool,
}

struct BatchOutcome {
    index: usize,
    size: usize,
    attempts: u32,
    succeeded: bool,
}

/// Embeds and upserts documents batch by batch.
pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    options: IngestOptions,
    strategy: RebuildStrategy,
    lock_dir: Option<PathBuf>,
    progress: Arc<IngestProgress>,
}

impl Indexer {
    #[inline]
    pub fn new(embedder: Arc<dyn Embedder>, retry: RetryPolicy, options: IngestOptions) -> Self {
        Self {
            embedder,
            retry,
            options,
            strategy: RebuildStrategy::default(),
            lock_dir: None,
            progress: Arc::new(IngestProgress::default()),
        }
    }

    #[inline]
    pub fn from_config(embedder: Arc<dyn Embedder>, config: &IngestConfig) -> Self {
        Self::new(
            embedder,
            RetryPolicy::from_config(config),
            IngestOptions::from_config(config),
        )
        .with_strategy(config.rebuild_strategy)
    }

    #[inline]
    pub fn with_strategy(mut self, strategy: RebuildStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Guard rebuilds with a lock file in `dir`.
    #[inline]
    pub fn with_lock_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.lock_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    #[inline]
    pub fn progress(&self) -> Arc<IngestProgress> {
        Arc::clone(&self.progress)
    }

    /// Upsert `documents` into `index` in ordered batches.
    ///
    /// Failing batches are retried per the [`RetryPolicy`], then counted and skipped. This never
    /// fails as a whole; check [`IngestReport::failed_batches`].
    #[inline]
    pub async fn ingest(&self, index: &dyn VectorIndex, documents: &[Document]) -> IngestReport {
        let started = Instant::now();
        let batch_size = self.options.batch_size.max(1);
        let total_batches = documents.len().div_ceil(batch_size);

        info!(
            "Ingesting {} documents into '{}' in {} batches of up to {}",
            documents.len(),
            index.name(),
            total_batches,
            batch_size
        );

        let bar = progress_bar(documents.len() as u64);
        let bar_ref = &bar;

        let outcomes: Vec<BatchOutcome> = stream::iter(documents.chunks(batch_size).enumerate())
            .map(move |(batch_index, batch)| {
                self.submit_batch(index, batch_index, batch, total_batches, bar_ref)
            })
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await;

        bar.finish_and_clear();

        let mut report = IngestReport {
            total_documents: documents.len(),
            batches: outcomes.len(),
            succeeded: 0,
            failed_batches: 0,
            failed_documents: 0,
            failed_batch_indices: Vec::new(),
            attempts: 0,
            elapsed: Duration::ZERO,
        };
        for outcome in outcomes {
            report.attempts += outcome.attempts;
            if outcome.succeeded {
                report.succeeded += outcome.size;
            } else {
                report.failed_batches += 1;
                report.failed_documents += outcome.size;
                report.failed_batch_indices.push(outcome.index);
            }
        }
        report.elapsed = started.elapsed();

        if report.failed_batches > 0 {
            warn!(
                "Ingestion finished with {} failed batches ({} documents not indexed)",
                report.failed_batches, report.failed_documents
            );
        } else {
            info!(
                "Ingestion finished: {} documents in {:?}",
                report.succeeded, report.elapsed
            );
        }

        report
    }

    async fn submit_batch(
        &self,
        index: &dyn VectorIndex,
        batch_index: usize,
        batch: &[Document],
        total_batches: usize,
        bar: &ProgressBar,
    ) -> BatchOutcome {
        let label = format!("Batch {}/{}", batch_index + 1, total_batches);
        let outcome = self
            .retry
            .run(&label, move |_| self.upsert_batch(index, batch))
            .await;

        let succeeded = match outcome.result {
            Ok(()) => {
                debug!("{} stored {} documents", label, batch.len());
                true
            }
            Err(e) => {
                error!(
                    "{} failed after {} attempts, skipping {} documents: {}",
                    label,
                    outcome.attempts,
                    batch.len(),
                    e
                );
                self.progress.failed_batches.fetch_add(1, Ordering::Relaxed);
                false
            }
        };

        self.progress
            .processed_documents
            .fetch_add(batch.len(), Ordering::Relaxed);
        let completed = self.progress.completed_batches.fetch_add(1, Ordering::Relaxed) + 1;
        bar.inc(batch.len() as u64);

        if completed % self.options.progress_interval == 0 {
            let snapshot = self.progress.snapshot();
            info!(
                "Progress: {}/{} batches, {} documents processed, {} batches failed",
                completed, total_batches, snapshot.processed_documents, snapshot.failed_batches
            );
        }

        if !self.options.pacing.is_zero() {
            sleep(self.options.pacing).await;
        }

        BatchOutcome {
            index: batch_index,
            size: batch.len(),
            attempts: outcome.attempts,
            succeeded,
        }
    }

    /// One attempt: embed every document in the batch, then upsert them together.
    async fn upsert_batch(&self, index: &dyn VectorIndex, batch: &[Document]) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        if vectors.len() != batch.len() {
            return Err(RecallError::Embedding(format!(
                "Expected {} embeddings, got {}",
                batch.len(),
                vectors.len()
            )));
        }

        let records: Vec<IndexedDocument> = batch
            .iter()
            .zip(vectors)
            .map(|(document, vector)| IndexedDocument {
                id: Uuid::new_v4().to_string(),
                vector,
                document: document.clone(),
            })
            .collect();

        index.upsert(&records).await
    }

    /// Replace `collection` with a fresh index of `documents`.
    #[inline]
    pub async fn rebuild(
        &self,
        store: &dyn CollectionStore,
        collection: &str,
        documents: &[Document],
    ) -> Result<RebuildReport> {
        if !is_valid_collection_name(collection) {
            return Err(RecallError::Config(format!(
                "invalid collection name {collection:?}: use letters, digits, '-' and '_'"
            )));
        }

        let _lock = match &self.lock_dir {
            Some(dir) => Some(RebuildLock::acquire(dir, collection)?),
            None => None,
        };

        info!(
            "Rebuilding collection '{}' ({} strategy)",
            collection, self.strategy
        );

        match self.strategy {
            RebuildStrategy::InPlace => {
                let replaced_existing = store.delete(collection).await?;
                let index = store.create(collection).await?;
                let ingest = self.ingest(index.as_ref(), documents).await;

                Ok(RebuildReport {
                    collection: collection.to_string(),
                    strategy: self.strategy,
                    ingest,
                    replaced_existing,
                    committed: true,
                })
            }
            RebuildStrategy::Staged => {
                let staging = staging_name(collection);
                store.delete(&staging).await?;
                let index = store.create(&staging).await?;
                let ingest = self.ingest(index.as_ref(), documents).await;
                drop(index);

                if ingest.succeeded == 0 && ingest.total_documents > 0 {
                    error!(
                        "Every batch failed; keeping the existing '{}' collection",
                        collection
                    );
                    store.delete(&staging).await?;
                    return Ok(RebuildReport {
                        collection: collection.to_string(),
                        strategy: self.strategy,
                        ingest,
                        replaced_existing: false,
                        committed: false,
                    });
                }

                let replaced_existing = store.exists(collection).await?;
                store.replace(&staging, collection).await?;

                Ok(RebuildReport {
                    collection: collection.to_string(),
                    strategy: self.strategy,
                    ingest,
                    replaced_existing,
                    committed: true,
                })
            }
        }
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    if !console::user_attended_stderr() {
        return ProgressBar::hidden();
    }

    match ProgressStyle::with_template("{spinner} [{pos}/{len}] Indexing documents {wide_bar}") {
        Ok(style) => ProgressBar::new(len).with_style(style),
        Err(_) => ProgressBar::new(len),
    }
}

/// Exclusive marker file held for the duration of a rebuild.
#[derive(Debug)]
pub struct RebuildLock {
    path: PathBuf,
}

impl RebuildLock {
    /// Fails with [`RecallError::Busy`] if another rebuild holds the lock.
    #[inline]
    pub fn acquire(dir: &Path, collection: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(".{collection}.lock"));

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RecallError::Busy(format!(
                    "a rebuild of '{}' is already running (remove {} if it is stale)",
                    collection,
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "started={}", Utc::now().to_rfc3339())?;
        debug!("Acquired rebuild lock {}", path.display());

        Ok(Self { path })
    }
}

impl Drop for RebuildLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}
