use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecallError>;

#[derive(Error, Debug)]
pub enum RecallError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RecallError {
    /// Whether retrying the same call may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod embeddings;
pub mod indexer;
pub mod records;
pub mod search;
pub mod server;
pub mod stats;

#[cfg(test)]
mod testing;
