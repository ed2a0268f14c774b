use axum::http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM quota exceeded: {0}")]
    LlmQuotaExceeded(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("HuggingFace Hub error: {0}")]
    HfHub(#[from] hf_hub::api::tokio::ApiError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

impl RagError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::RetrievalUnavailable(_)
            | RagError::Embedding(_)
            | RagError::LlmQuotaExceeded(_)
            | RagError::StorageUnavailable(_)
            | RagError::CacheUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::LlmUnavailable(_) => StatusCode::BAD_GATEWAY,
            RagError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RagError::InvalidConfiguration(_)
            | RagError::Io(_)
            | RagError::Serde(_)
            | RagError::Metrics(_)
            | RagError::Candle(_)
            | RagError::HfHub(_)
            | RagError::Tokenizer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation_error",
            RagError::InvalidConfiguration(_) => "invalid_configuration",
            RagError::RetrievalUnavailable(_) => "retrieval_unavailable",
            RagError::Embedding(_) => "embedding_error",
            RagError::LlmUnavailable(_) => "llm_unavailable",
            RagError::LlmQuotaExceeded(_) => "llm_quota_exceeded",
            RagError::StorageUnavailable(_) => "storage_unavailable",
            RagError::CacheUnavailable(_) => "cache_unavailable",
            RagError::Timeout(_) => "timeout",
            _ => "internal_error",
        }
    }
}

impl From<qdrant_client::QdrantError> for RagError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        RagError::RetrievalUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        RagError::StorageUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for RagError {
    fn from(err: redis::RedisError) -> Self {
        RagError::CacheUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for RagError {
    fn from(err: config::ConfigError) -> Self {
        RagError::InvalidConfiguration(err.to_string())
    }
}
