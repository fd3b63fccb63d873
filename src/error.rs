// src/error.rs
// Standardized error types for opencode-mem

use thiserror::Error;

/// Main error type for the opencode-mem library
#[derive(Error, Debug)]
pub enum MemError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("content contains only private regions")]
    BlockedPrivate,

    #[error("content exceeds the maximum length")]
    ContentTooLarge,

    #[error("content is empty")]
    ContentEmpty,

    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using MemError
pub type Result<T> = std::result::Result<T, MemError>;

impl MemError {
    /// Stable machine-readable code carried on validation-class API errors.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            MemError::InvalidInput(_) => Some("BAD_REQUEST"),
            MemError::BlockedPrivate => Some("BLOCKED_PRIVATE"),
            MemError::ContentTooLarge => Some("CONTENT_TOO_LARGE"),
            MemError::ContentEmpty => Some("CONTENT_EMPTY"),
            _ => None,
        }
    }

    /// HTTP status this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            MemError::InvalidInput(_)
            | MemError::BlockedPrivate
            | MemError::ContentTooLarge
            | MemError::ContentEmpty => 400,
            MemError::FeatureDisabled(_) => 403,
            MemError::NotFound(_) => 404,
            MemError::RateLimited => 429,
            _ => 500,
        }
    }
}

impl From<String> for MemError {
    fn from(s: String) -> Self {
        MemError::Other(s)
    }
}

impl From<tokio::task::JoinError> for MemError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            MemError::Cancelled
        } else {
            MemError::Other(err.to_string())
        }
    }
}

impl From<MemError> for String {
    fn from(err: MemError) -> Self {
        err.to_string()
    }
}
