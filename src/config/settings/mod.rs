
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::database::{ScoreOrder, is_valid_collection_name};
use crate::indexer::RebuildStrategy;

/// Environment variable overriding the application home directory
pub const HOME_ENV: &str = "CHAT_RECALL_HOME";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    /// Texts per `/api/embed` request
    pub batch_size: u32,
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 32,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Documents per upsert
    pub batch_size: usize,
    /// Total attempts per batch, including the first
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Sleep after each batch
    pub pacing_ms: u64,
    pub concurrency: usize,
    /// Emit a progress line every N batches
    pub progress_interval: usize,
    pub rebuild_strategy: RebuildStrategy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
            pacing_ms: 100,
            concurrency: 1,
            progress_interval: 10,
            rebuild_strategy: RebuildStrategy::Staged,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Collection served by `query`, `stats` and `serve`
    pub collection: String,
    pub default_max_results: usize,
    pub metric: ScoreOrder,
    pub timeout_secs: u64,
    /// Extra attempts after a transient failure at query time
    pub query_retries: u32,
    pub stats_sample_cap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            collection: "full".to_string(),
            default_max_results: 5,
            metric: ScoreOrder::HigherIsBetter,
            timeout_secs: 30,
            query_retries: 1,
            stats_sample_cap: 200,
        }
    }
}

impl RetrievalConfig {
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding batch size: {0} (must be between 1 and 1000)")]
    InvalidEmbeddingBatchSize(u32),
    #[error("Invalid timeout: {0}s (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid ingest batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(usize),
    #[error("Invalid max retries: {0} (must be between 1 and 10)")]
    InvalidMaxRetries(u32),
    #[error("Retry base delay ({0}ms) must not exceed max delay ({1}ms)")]
    RetryDelayOrder(u64, u64),
    #[error("Invalid concurrency: {0} (must be between 1 and 8)")]
    InvalidConcurrency(usize),
    #[error("Invalid progress interval: {0} (must be at least 1)")]
    InvalidProgressInterval(usize),
    #[error("Invalid collection name: {0:?} (letters, digits, '-' and '_' only)")]
    InvalidCollectionName(String),
    #[error("Invalid default max results: {0} (must be between 1 and 100)")]
    InvalidMaxResults(usize),
    #[error("Invalid query retries: {0} (must be at most 3)")]
    InvalidQueryRetries(u32),
    #[error("Invalid stats sample cap: {0} (must be between 1 and 10000)")]
    InvalidSampleCap(usize),
    #[error("Invalid bind address: {0}")]
    InvalidBind(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Resolve the application home: `CHAT_RECALL_HOME`, then `~/.chat-recall`.
    #[inline]
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }

        dirs::home_dir()
            .map(|home| home.join(".chat-recall"))
            .or({
                #[cfg(windows)]
                {
                    dirs::data_dir().map(|data| data.join("chat-recall"))
                }
                #[cfg(not(windows))]
                {
                    None
                }
            })
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Directory holding one LanceDB database per collection
    #[inline]
    pub fn collections_dir(&self) -> PathBuf {
        self.get_base_dir().join("collections")
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.ingest.validate()?;
        self.retrieval.validate()?;
        self.server.validate()?;
        Ok(())
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidEmbeddingBatchSize(self.batch_size));
        }

        if !(1..=600).contains(&self.timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.timeout_secs));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.batch_size) {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(1..=10).contains(&self.max_retries) {
            return Err(ConfigError::InvalidMaxRetries(self.max_retries));
        }

        if self.retry_base_ms > self.retry_max_ms {
            return Err(ConfigError::RetryDelayOrder(
                self.retry_base_ms,
                self.retry_max_ms,
            ));
        }

        if !(1..=8).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }

        if self.progress_interval == 0 {
            return Err(ConfigError::InvalidProgressInterval(self.progress_interval));
        }

        Ok(())
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_collection_name(&self.collection) {
            return Err(ConfigError::InvalidCollectionName(self.collection.clone()));
        }

        if !(1..=100).contains(&self.default_max_results) {
            return Err(ConfigError::InvalidMaxResults(self.default_max_results));
        }

        if !(1..=600).contains(&self.timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.timeout_secs));
        }

        if self.query_retries > 3 {
            return Err(ConfigError::InvalidQueryRetries(self.query_retries));
        }

        if !(1..=10_000).contains(&self.stats_sample_cap) {
            return Err(ConfigError::InvalidSampleCap(self.stats_sample_cap));
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|_| ConfigError::InvalidBind(self.bind.clone()))
    }
}
