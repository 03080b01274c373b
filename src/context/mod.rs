// Process context
// Built once at startup and shared by every query, stats and HTTP handler

use std::sync::Arc;

use tracing::{info, warn};

use crate::Result;
use crate::config::Config;
use crate::database::lancedb::LanceCollections;
use crate::database::{CollectionStore, VectorIndex};
use crate::embeddings::{Embedder, OllamaClient};

/// The embedder plus the opened collection, if it could be opened.
pub struct RecallContext {
    embedder: Arc<dyn Embedder>,
    index: Option<Arc<dyn VectorIndex>>,
    collection: String,
    unavailable_reason: Option<String>,
}

impl RecallContext {
    #[inline]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Option<Arc<dyn VectorIndex>>,
        collection: &str,
    ) -> Self {
        let unavailable_reason = index
            .is_none()
            .then(|| format!("collection '{collection}' is not loaded"));
        Self {
            embedder,
            index,
            collection: collection.to_string(),
            unavailable_reason,
        }
    }

    /// Open `collection` from `store`. A collection that cannot be opened is logged and left
    /// unloaded so the caller can still start and report it.
    #[inline]
    pub async fn open(
        embedder: Arc<dyn Embedder>,
        store: &dyn CollectionStore,
        collection: &str,
    ) -> Self {
        match store.open(collection).await {
            Ok(index) => {
                info!("Collection '{}' loaded", collection);
                Self::new(embedder, Some(index), collection)
            }
            Err(e) => {
                warn!("Collection '{}' could not be loaded: {}", collection, e);
                Self {
                    unavailable_reason: Some(e.to_string()),
                    ..Self::new(embedder, None, collection)
                }
            }
        }
    }

    /// Ollama embedder and LanceDB collections from `config`.
    #[inline]
    pub async fn from_config(config: &Config, collection: &str) -> Result<Self> {
        let embedder = Arc::new(OllamaClient::new(&config.ollama)?);
        let store = LanceCollections::new(config.collections_dir(), config.retrieval.metric);
        Ok(Self::open(embedder, &store, collection).await)
    }

    #[inline]
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    #[inline]
    pub fn index(&self) -> Option<&Arc<dyn VectorIndex>> {
        self.index.as_ref()
    }

    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.index.is_some()
    }

    #[inline]
    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable_reason.as_deref()
    }
}
