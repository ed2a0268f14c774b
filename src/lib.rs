pub mod api;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod history;
pub mod ingestion;
pub mod llm;
pub mod metrics;
pub mod query;
pub mod retrieval;
pub mod storage;

pub use error::{RagError, Result};
