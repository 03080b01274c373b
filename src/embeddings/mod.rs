// Embeddings module
// Text-to-vector providers behind a common async trait

pub mod ollama;

use async_trait::async_trait;

use crate::Result;

pub use ollama::OllamaClient;

/// Turns text into fixed-size vectors.
///
/// Implementations classify failures: [`crate::RecallError::Network`] and
/// [`crate::RecallError::Timeout`] are worth retrying, anything else is permanent.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, returning one vector per input in the same order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
