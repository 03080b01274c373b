use super::*;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, batch_size: u32) -> OllamaClient {
    let url = Url::parse(&server.uri()).expect("mock server uri should parse");
    let config = OllamaConfig {
        host: url.host_str().expect("mock server has a host").to_string(),
        port: url.port().expect("mock server has a port"),
        model: "test-model".to_string(),
        batch_size,
        timeout_secs: 5,
        ..OllamaConfig::default()
    };
    OllamaClient::new(&config).expect("should create client")
}

#[test]
fn client_configuration() {
    let config = OllamaConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        batch_size: 128,
        timeout_secs: 12,
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    assert_eq!(client.model(), "test-model");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.timeout, Duration::from_secs(12));

    let client = client.with_timeout(Duration::from_secs(60));
    assert_eq!(client.timeout, Duration::from_secs(60));
}

#[tokio::test(flavor = "multi_thread")]
async fn embed_batch_splits_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "model": "test-model" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2], [0.3, 0.4]]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server, 2);
    let texts: Vec<String> = (0..4).map(|i| format!("text {i}")).collect();
    let vectors = client
        .embed_batch(&texts)
        .await
        .expect("should embed batch");

    assert_eq!(vectors.len(), 4);
    assert_eq!(vectors[2], vec![0.1, 0.2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, 8);
    let error = client
        .embed("hello there")
        .await
        .expect_err("503 should fail");

    assert!(matches!(error, RecallError::Network(_)));
    assert!(error.is_transient());
}

#[tokio::test(flavor = "multi_thread")]
async fn client_errors_are_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "model not found" })))
        .mount(&server)
        .await;

    let client = client_for(&server, 8);
    let error = client
        .embed("hello there")
        .await
        .expect_err("404 should fail");

    assert!(matches!(error, RecallError::Embedding(_)));
    assert!(!error.is_transient());
}

#[tokio::test(flavor = "multi_thread")]
async fn count_mismatch_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embeddings": [[1.0]] })))
        .mount(&server)
        .await;

    let client = client_for(&server, 8);
    let texts = vec!["one".to_string(), "two".to_string()];
    let error = client
        .embed_batch(&texts)
        .await
        .expect_err("mismatched response should fail");

    assert!(matches!(error, RecallError::Embedding(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn health_check_validates_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{ "name": "test-model", "size": 1, "digest": "abc" }]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, 8);
    let other = client.clone();
    let other = OllamaClient {
        model: "missing-model".to_string(),
        ..other
    };

    let results = tokio::task::spawn_blocking(move || (client.health_check(), other.health_check()))
        .await
        .expect("blocking task should finish");

    assert!(results.0.is_ok());
    assert!(results.1.is_err());
}
