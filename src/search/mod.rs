// Query engine
// Embeds a question, runs a nearest-neighbour search and filters by score


use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::RetrievalConfig;
use crate::context::RecallContext;
use crate::database::{ScoreOrder, ScoredDocument};
use crate::indexer::{Backoff, RetryOn, RetryPolicy};
use crate::records::{DocumentMetadata, UNKNOWN_SENDER, UNKNOWN_TIME};
use crate::{RecallError, Result};

/// Largest `max_results` honoured; larger requests are clamped.
pub const MAX_RESULTS_CAP: usize = 100;
pub const DEFAULT_MAX_RESULTS: usize = 5;

/// Question used by health probes.
pub const PROBE_QUESTION: &str = "测试";

const fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default = "default_max_results", alias = "maxResults")]
    pub max_results: usize,
    #[serde(default, alias = "similarityThreshold")]
    pub similarity_threshold: Option<f32>,
}

impl QueryRequest {
    #[inline]
    pub fn new(question: impl Into<String>, max_results: usize) -> Self {
        Self {
            question: question.into(),
            max_results,
            similarity_threshold: None,
        }
    }

    #[inline]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMatch {
    pub content: String,
    pub metadata: DocumentMetadata,
    pub score: f32,
}

impl From<ScoredDocument> for QueryMatch {
    #[inline]
    fn from(scored: ScoredDocument) -> Self {
        Self {
            content: scored.document.content,
            metadata: scored.document.metadata,
            score: scored.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub question: String,
    /// Store order, best first
    pub records: Vec<QueryMatch>,
    /// Number of records left after threshold filtering
    pub total_found: usize,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("max_results must be greater than 0 (got {0})")]
    InvalidMaxResults(usize),
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    /// Stable machine-readable code.
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyQuestion | Self::InvalidMaxResults(_) => "bad_input",
            Self::IndexUnavailable(_) => "no_index",
            Self::Upstream(_) => "upstream_failure",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<RecallError> for QueryError {
    #[inline]
    fn from(error: RecallError) -> Self {
        match error {
            RecallError::Timeout(after) => Self::Timeout(after),
            RecallError::IndexUnavailable(reason) => Self::IndexUnavailable(reason),
            other => Self::Upstream(other.to_string()),
        }
    }
}

/// One record of the lenient payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimpleRecord {
    pub content: String,
    pub sender: String,
    pub time: String,
    pub similarity: f32,
}

/// Lenient payload: either results or an error message, never an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SimpleQueryResponse {
    Found {
        question: String,
        records: Vec<SimpleRecord>,
        count: usize,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySettings {
    /// Applied to each embedding and search call separately
    pub timeout: Duration,
    /// Extra attempts after a transient failure
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

impl QuerySettings {
    #[inline]
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            timeout: config.timeout(),
            retries: config.query_retries,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Keep results whose score passes `threshold` under `order`, preserving their order.
#[inline]
pub fn apply_threshold(
    results: Vec<ScoredDocument>,
    order: ScoreOrder,
    threshold: Option<f32>,
) -> Vec<ScoredDocument> {
    match threshold {
        Some(threshold) => results
            .into_iter()
            .filter(|r| order.passes(r.score, threshold))
            .collect(),
        None => results,
    }
}

pub struct QueryEngine {
    context: Arc<RecallContext>,
    settings: QuerySettings,
    retry: RetryPolicy,
}

impl QueryEngine {
    #[inline]
    pub fn new(context: Arc<RecallContext>, settings: QuerySettings) -> Self {
        let retry = RetryPolicy::new(settings.retries + 1, Backoff::Fixed(settings.retry_delay))
            .retry_on(RetryOn::Transient);
        Self {
            context,
            settings,
            retry,
        }
    }

    #[inline]
    pub fn context(&self) -> &Arc<RecallContext> {
        &self.context
    }

    /// Validate, embed, search and filter.
    #[inline]
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(QueryError::EmptyQuestion);
        }
        if request.max_results == 0 {
            return Err(QueryError::InvalidMaxResults(request.max_results));
        }
        let index = self.context.index().ok_or_else(|| {
            QueryError::IndexUnavailable(
                self.context
                    .unavailable_reason()
                    .unwrap_or("index not initialized")
                    .to_string(),
            )
        })?;
        let k = request.max_results.min(MAX_RESULTS_CAP);

        let embedder = self.context.embedder();
        let vector = self
            .guarded("embed question", || embedder.embed(question))
            .await?;
        let results = self
            .guarded("search", || index.knn_search(&vector, k))
            .await?;
        let found = results.len();

        let records: Vec<QueryMatch> =
            apply_threshold(results, index.score_order(), request.similarity_threshold)
                .into_iter()
                .map(QueryMatch::from)
                .collect();
        debug!(
            "Query returned {} of {} candidates above threshold {:?}",
            records.len(),
            found,
            request.similarity_threshold
        );

        Ok(QueryResult {
            question: request.question.clone(),
            total_found: records.len(),
            records,
        })
    }

    /// Same pipeline without a threshold, folding every failure into the payload.
    #[inline]
    pub async fn query_simple(&self, question: &str, max_results: usize) -> SimpleQueryResponse {
        match self.query(&QueryRequest::new(question, max_results)).await {
            Ok(result) => {
                let records: Vec<SimpleRecord> = result
                    .records
                    .into_iter()
                    .map(|m| SimpleRecord {
                        sender: m.metadata.sender_or(UNKNOWN_SENDER).to_string(),
                        time: m.metadata.chat_time_or(UNKNOWN_TIME).to_string(),
                        content: m.content,
                        similarity: m.score,
                    })
                    .collect();
                SimpleQueryResponse::Found {
                    question: result.question,
                    count: records.len(),
                    records,
                }
            }
            Err(e) => {
                info!("Simple query failed: {}", e);
                SimpleQueryResponse::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Run a one-result probe query; returns the number of records found.
    #[inline]
    pub async fn probe(&self) -> Result<usize, QueryError> {
        let result = self.query(&QueryRequest::new(PROBE_QUESTION, 1)).await?;
        Ok(result.total_found)
    }

    /// Run `op` under the per-call timeout, retrying transient failures.
    async fn guarded<T, F, Fut>(&self, label: &str, op: F) -> Result<T, QueryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limit = self.settings.timeout;
        let op = &op;
        let outcome = self
            .retry
            .run(label, move |_| async move {
                timeout(limit, op())
                    .await
                    .unwrap_or(Err(RecallError::Timeout(limit)))
            })
            .await;
        outcome.result.map_err(QueryError::from)
    }
}
