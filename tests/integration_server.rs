#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// HTTP API over a real listener, backed by in-memory collections

use async_trait::async_trait;
use chat_recall::context::RecallContext;
use chat_recall::database::memory::MemoryCollections;
use chat_recall::database::{CollectionStore, ScoreOrder};
use chat_recall::embeddings::Embedder;
use chat_recall::indexer::{Backoff, IngestOptions, Indexer, RetryPolicy};
use chat_recall::records::{Document, RawRecord, normalize};
use chat_recall::search::{QueryEngine, QuerySettings};
use chat_recall::server::{AppState, router};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct CharEmbedder;

#[async_trait]
impl Embedder for CharEmbedder {
    async fn embed(&self, text: &str) -> chat_recall::Result<Vec<f32>> {
        let mut vector = vec![0.0_f32; 16];
        for c in text.chars() {
            vector[(c as usize) % 16] += 1.0;
        }
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> chat_recall::Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

fn fixture_documents() -> Vec<Document> {
    [
        ("alice", "2023-03-01 09:00:00", "周末一起去爬山吧"),
        ("bob", "2023-03-01 09:01:00", "好啊，我带水和零食"),
        ("carol", "2023-03-02 18:30:00", "晚上吃火锅怎么样"),
    ]
    .iter()
    .map(|(talker, time, msg)| {
        let record = RawRecord::parse(
            "chat.csv",
            &format!("CreateTime: {time}\ntalker: {talker}\ntype_name: 文本\nmsg: {msg}"),
        );
        normalize(&record).expect("fixture should be accepted")
    })
    .collect()
}

async fn loaded_context() -> RecallContext {
    let store = MemoryCollections::new(ScoreOrder::HigherIsBetter);
    let documents = fixture_documents();

    let indexer = Indexer::new(
        Arc::new(CharEmbedder),
        RetryPolicy::new(1, Backoff::Fixed(Duration::ZERO)),
        IngestOptions {
            batch_size: 2,
            concurrency: 1,
            pacing: Duration::ZERO,
            progress_interval: 1,
        },
    );
    indexer
        .rebuild(&store, "full", &documents)
        .await
        .expect("rebuild should succeed");

    RecallContext::open(Arc::new(CharEmbedder), &store, "full").await
}

async fn spawn_app(context: RecallContext) -> String {
    let engine = QueryEngine::new(Arc::new(context), QuerySettings::default());
    let app = router(AppState::new(Arc::new(engine), 200));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = listener.local_addr().expect("should have address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    format!("http://{addr}")
}

fn agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .into()
}

/// Blocking request on a worker thread; returns the status and parsed JSON body.
async fn request(verb: &'static str, url: String, body: Option<Value>) -> (u16, Value) {
    tokio::task::spawn_blocking(move || {
        let agent = agent();
        let mut response = match (verb, body) {
            ("GET", _) => agent.get(&url).call(),
            (_, Some(body)) => agent
                .post(&url)
                .header("Content-Type", "application/json")
                .send(&body.to_string()),
            (_, None) => agent.post(&url).send_empty(),
        }
        .expect("request should complete");
        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .expect("body should be readable");
        (
            status,
            serde_json::from_str(&text).expect("body should be JSON"),
        )
    })
    .await
    .expect("request task should not panic")
}

#[tokio::test(flavor = "multi_thread")]
async fn query_endpoint_returns_ranked_records() {
    let base = spawn_app(loaded_context().await).await;
    let target = &fixture_documents()[2];

    let (status, body) = request(
        "POST",
        format!("{base}/query"),
        Some(json!({ "question": target.content, "maxResults": 2 })),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    assert_eq!(body["total_found"], 2);
    assert_eq!(body["records"][0]["metadata"]["sender"], "carol");
    assert!(body["records"][0]["score"].as_f64().unwrap_or_default() > 0.99);
}

#[tokio::test(flavor = "multi_thread")]
async fn query_endpoint_rejects_bad_input() {
    let base = spawn_app(loaded_context().await).await;

    let (status, body) = request(
        "POST",
        format!("{base}/query"),
        Some(json!({ "question": "   " })),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_input");

    let (status, body) = request(
        "POST",
        format!("{base}/query"),
        Some(json!({ "max_results": 3 })),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_input");
}

#[tokio::test(flavor = "multi_thread")]
async fn health_and_stats_with_loaded_index() {
    let base = spawn_app(loaded_context().await).await;

    let (status, body) = request("GET", format!("{base}/health"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["probe_results"], 1);

    let (status, body) = request("GET", format!("{base}/stats"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["collection"], "full");
    assert_eq!(body["total_count"], 3);
    assert_eq!(body["unique_senders"], json!(["alice", "bob", "carol"]));
    assert_eq!(body["time_range"]["earliest"], "2023-03-01 09:00:00");
}

#[tokio::test(flavor = "multi_thread")]
async fn server_starts_without_index() {
    let store = MemoryCollections::new(ScoreOrder::HigherIsBetter);
    assert!(!store.exists("full").await.expect("should check"));
    let context = RecallContext::open(Arc::new(CharEmbedder), &store, "full").await;
    let base = spawn_app(context).await;

    let (status, body) = request("GET", format!("{base}/"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["index_loaded"], false);

    let (status, body) = request("GET", format!("{base}/health"), None).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["code"], "no_index");

    let (status, body) = request(
        "POST",
        format!("{base}/query"),
        Some(json!({ "question": "hello" })),
    )
    .await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["code"], "no_index");

    let (status, body) = request(
        "POST",
        format!("{base}/query_simple?question=hello&max_results=2"),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert!(body["error"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn simple_query_uses_query_string() {
    let base = spawn_app(loaded_context().await).await;

    let (status, body) = request(
        "POST",
        format!("{base}/query_simple?question=%E7%88%AC%E5%B1%B1&max_results=2"),
        None,
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["question"], "爬山");
    assert_eq!(body["count"], 2);
    assert!(body["records"][0]["sender"].is_string());
    assert!(body["records"][0]["time"].is_string());
}
