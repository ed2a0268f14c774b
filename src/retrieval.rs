use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};
use uuid::Uuid;
use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingService;
use crate::ingestion::Chunk;
use crate::storage::{ChunkRecord, SearchQuery, VectorStorage};
use crate::{RagError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub document: String,
    pub chunk_index: usize,
    pub text: String,
    pub score: f32,
}

pub struct Retriever {
    storage: Arc<dyn VectorStorage>,
    embedding_service: Arc<dyn EmbeddingService>,
    config: RetrievalConfig,
    collection_ready: OnceCell<()>,
}

impl Retriever {
    pub fn new(
        storage: Arc<dyn VectorStorage>,
        embedding_service: Arc<dyn EmbeddingService>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            storage,
            embedding_service,
            config,
            collection_ready: OnceCell::new(),
        }
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }

    pub fn collection_name(&self) -> &str {
        self.storage.collection_name()
    }

    /// Creates the backing collection sized for the embedding model. Runs
    /// until it succeeds once; a failed attempt is retried on the next call.
    pub async fn prepare(&self) -> Result<()> {
        self.collection_ready
            .get_or_try_init(|| async {
                self.storage
                    .ensure_collection(self.embedding_service.dimension())
                    .await
                    .map_err(unavailable)
            })
            .await?;
        Ok(())
    }

    pub fn point_id(document_id: &str, chunk_index: usize) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}", document_id, chunk_index).as_bytes())
    }

    /// Embeds `chunks` and replaces everything stored for `document_id` with
    /// them. Returns once the chunks are searchable.
    pub async fn index(&self, document_id: &str, chunks: &[Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        self.prepare().await?;

        let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        let embeddings = self.embedding_service.embed_batch(texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(RagError::Embedding(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| ChunkRecord {
                id: Self::point_id(document_id, chunk.index),
                source: document_id.to_string(),
                chunk_index: chunk.index,
                start: chunk.start,
                end: chunk.end,
                text: chunk.text.clone(),
                embedding,
            })
            .collect();

        self.storage.delete_source(document_id).await.map_err(|e| {
            error!(document = document_id, error = %e, "Failed to remove previous chunks");
            unavailable(e)
        })?;
        self.storage.upsert(records).await.map_err(|e| {
            error!(document = document_id, error = %e, "Failed to store chunks");
            unavailable(e)
        })?;

        info!(document = document_id, chunks = chunks.len(), "Chunks indexed");
        Ok(chunks.len())
    }

    /// Up to `top_k` chunks, most similar first. An empty index yields an
    /// empty list.
    pub async fn search(&self, question: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        self.prepare().await?;
        let embedding = self.embedding_service.embed_text(question).await?;

        let results = self
            .storage
            .search(SearchQuery { embedding, top_k })
            .await
            .map_err(|e| {
                error!(error = %e, "Vector search failed");
                unavailable(e)
            })?;

        let mut chunks: Vec<RetrievedChunk> = results
            .into_iter()
            .map(|result| RetrievedChunk {
                document: result.chunk.source,
                chunk_index: result.chunk.chunk_index,
                text: result.chunk.text,
                score: result.score,
            })
            .collect();

        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        chunks.truncate(top_k);

        debug!(results = chunks.len(), top_k, "Search completed");
        Ok(chunks)
    }

    pub async fn document_count(&self) -> Result<u64> {
        self.prepare().await?;
        self.storage.count().await.map_err(unavailable)
    }

    pub async fn health_check(&self) -> bool {
        match self.storage.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                error!(error = %e, "Vector store health check failed");
                false
            }
        }
    }
}

fn unavailable(err: RagError) -> RagError {
    match err {
        RagError::RetrievalUnavailable(_) => err,
        other => RagError::RetrievalUnavailable(other.to_string()),
    }
}
