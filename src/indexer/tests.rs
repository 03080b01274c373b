use super::*;
use crate::database::ScoreOrder;
use crate::database::memory::MemoryCollections;
use crate::testing::{RecordingIndex, StubEmbedder, document, documents};
use tempfile::TempDir;

fn options(batch_size: usize) -> IngestOptions {
    IngestOptions {
        batch_size,
        concurrency: 1,
        pacing: Duration::ZERO,
        progress_interval: 1,
    }
}

fn indexer(embedder: Arc<dyn Embedder>, batch_size: usize) -> Indexer {
    Indexer::new(
        embedder,
        RetryPolicy::new(3, Backoff::Fixed(Duration::ZERO)),
        options(batch_size),
    )
}

fn always_failing() -> Arc<StubEmbedder> {
    Arc::new(StubEmbedder::failing(usize::MAX, || {
        RecallError::Network("connection refused".to_string())
    }))
}

#[tokio::test]
async fn batches_are_submitted_in_order() {
    let docs = documents(250);
    let index = RecordingIndex::new();

    let report = indexer(Arc::new(StubEmbedder::new()), 100)
        .ingest(&index, &docs)
        .await;

    assert_eq!(index.sizes(), vec![100, 100, 50]);
    let firsts = index
        .upsert_first_contents
        .lock()
        .expect("lock should not be poisoned")
        .clone();
    assert_eq!(
        firsts,
        vec![
            docs[0].content.clone(),
            docs[100].content.clone(),
            docs[200].content.clone()
        ]
    );
    assert_eq!(report.batches, 3);
    assert_eq!(report.succeeded, 250);
    assert_eq!(report.failed_batches, 0);
    assert_eq!(index.count().await.expect("should count"), 250);
}

#[tokio::test]
async fn failing_batch_is_retried_then_skipped() {
    let mut docs = documents(250);
    docs[150] = document(Some("mallory"), "POISON in the middle batch", None);
    let index = RecordingIndex::poisoned_by("POISON");

    let report = indexer(Arc::new(StubEmbedder::new()), 100)
        .ingest(&index, &docs)
        .await;

    // 1 + 3 + 1 attempts: only the poisoned batch is retried
    assert_eq!(index.upsert_attempts.load(Ordering::SeqCst), 5);
    assert_eq!(report.attempts, 5);
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.failed_batch_indices, vec![1]);
    assert_eq!(report.failed_documents, 100);
    assert_eq!(report.succeeded, 150);
    assert_eq!(index.sizes(), vec![100, 50]);
    assert_eq!(index.count().await.expect("should count"), 150);
}

#[tokio::test]
async fn transient_embedding_failure_recovers() {
    let embedder = Arc::new(StubEmbedder::failing(1, || {
        RecallError::Network("reset by peer".to_string())
    }));
    let index = RecordingIndex::new();

    let report = indexer(Arc::clone(&embedder) as Arc<dyn Embedder>, 10)
        .ingest(&index, &documents(30))
        .await;

    assert_eq!(report.failed_batches, 0);
    assert_eq!(report.attempts, 4);
    assert_eq!(embedder.calls(), 4);
    assert_eq!(index.count().await.expect("should count"), 30);
}

#[tokio::test]
async fn empty_input_does_nothing() {
    let index = RecordingIndex::new();
    let report = indexer(Arc::new(StubEmbedder::new()), 10)
        .ingest(&index, &[])
        .await;

    assert_eq!(report.batches, 0);
    assert_eq!(report.total_documents, 0);
    assert!(index.sizes().is_empty());
}

#[tokio::test]
async fn concurrent_batches_are_counted_exactly() {
    let index = RecordingIndex::new();
    let indexer = Indexer::new(
        Arc::new(StubEmbedder::new()),
        RetryPolicy::new(2, Backoff::Fixed(Duration::ZERO)),
        IngestOptions {
            concurrency: 4,
            ..options(7)
        },
    );

    let report = indexer.ingest(&index, &documents(70)).await;

    assert_eq!(report.batches, 10);
    assert_eq!(report.succeeded, 70);
    assert_eq!(index.count().await.expect("should count"), 70);

    let snapshot = indexer.progress().snapshot();
    assert_eq!(snapshot.completed_batches, 10);
    assert_eq!(snapshot.processed_documents, 70);
    assert_eq!(snapshot.failed_batches, 0);
}

#[tokio::test]
async fn rebuild_count_matches_documents() {
    let store = MemoryCollections::new(ScoreOrder::HigherIsBetter);
    let docs = documents(42);

    let report = indexer(Arc::new(StubEmbedder::new()), 10)
        .rebuild(&store, "full", &docs)
        .await
        .expect("rebuild should succeed");

    assert!(report.committed);
    assert!(!report.replaced_existing);
    assert_eq!(report.strategy, RebuildStrategy::Staged);
    let index = store.open("full").await.expect("should open");
    assert_eq!(index.count().await.expect("should count"), docs.len());
    assert!(!store.exists("full.staging").await.expect("should check"));
}

#[tokio::test]
async fn staged_rebuild_replaces_previous_contents() {
    let store = MemoryCollections::new(ScoreOrder::HigherIsBetter);
    let indexer = indexer(Arc::new(StubEmbedder::new()), 10);

    indexer
        .rebuild(&store, "full", &documents(25))
        .await
        .expect("first rebuild");
    let report = indexer
        .rebuild(&store, "full", &documents(5))
        .await
        .expect("second rebuild");

    assert!(report.replaced_existing);
    let index = store.open("full").await.expect("should open");
    assert_eq!(index.count().await.expect("should count"), 5);
}

#[tokio::test]
async fn staged_rebuild_keeps_old_collection_when_everything_fails() {
    let store = MemoryCollections::new(ScoreOrder::HigherIsBetter);
    indexer(Arc::new(StubEmbedder::new()), 10)
        .rebuild(&store, "full", &documents(3))
        .await
        .expect("initial rebuild");

    let report = indexer(always_failing(), 10)
        .rebuild(&store, "full", &documents(20))
        .await
        .expect("rebuild reports instead of failing");

    assert!(!report.committed);
    assert_eq!(report.ingest.failed_batches, 2);
    let index = store.open("full").await.expect("should open");
    assert_eq!(index.count().await.expect("should count"), 3);
    assert!(!store.exists("full.staging").await.expect("should check"));
}

#[tokio::test]
async fn in_place_rebuild_deletes_eagerly() {
    let store = MemoryCollections::new(ScoreOrder::HigherIsBetter);
    indexer(Arc::new(StubEmbedder::new()), 10)
        .rebuild(&store, "full", &documents(3))
        .await
        .expect("initial rebuild");

    let report = indexer(always_failing(), 10)
        .with_strategy(RebuildStrategy::InPlace)
        .rebuild(&store, "full", &documents(20))
        .await
        .expect("rebuild reports instead of failing");

    assert!(report.committed);
    assert!(report.replaced_existing);
    let index = store.open("full").await.expect("should open");
    assert_eq!(index.count().await.expect("should count"), 0);
}

#[tokio::test]
async fn concurrent_rebuild_is_rejected() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = MemoryCollections::new(ScoreOrder::HigherIsBetter);
    let indexer = indexer(Arc::new(StubEmbedder::new()), 10).with_lock_dir(temp_dir.path());

    let held = RebuildLock::acquire(temp_dir.path(), "full").expect("should take lock");
    let result = indexer.rebuild(&store, "full", &documents(3)).await;
    assert!(matches!(result, Err(RecallError::Busy(_))));

    // Other collections are unaffected
    indexer
        .rebuild(&store, "test", &documents(3))
        .await
        .expect("different collection should rebuild");

    drop(held);
    indexer
        .rebuild(&store, "full", &documents(3))
        .await
        .expect("rebuild after release should succeed");
    assert!(!temp_dir.path().join(".full.lock").exists());
}

#[tokio::test]
async fn invalid_collection_name_is_rejected() {
    let store = MemoryCollections::new(ScoreOrder::HigherIsBetter);
    let result = indexer(Arc::new(StubEmbedder::new()), 10)
        .rebuild(&store, "full.staging", &documents(1))
        .await;
    assert!(matches!(result, Err(RecallError::Config(_))));
}
