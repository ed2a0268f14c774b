use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;
use crate::Result;

/// One indexed chunk as held by the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub source: String,
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Empty on records returned by `search`.
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub embedding: Vec<f32>,
    pub top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk: ChunkRecord,
    pub score: f32,
}

#[async_trait]
pub trait VectorStorage: Send + Sync {
    /// Creates the collection if it does not exist yet.
    async fn ensure_collection(&self, dimension: usize) -> Result<()>;
    /// Inserts or replaces records; they are searchable once this returns.
    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<()>;
    /// Removes every record whose `source` equals `source`.
    async fn delete_source(&self, source: &str) -> Result<()>;
    /// Highest score first.
    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchResult>>;
    async fn count(&self) -> Result<u64>;
    async fn health_check(&self) -> Result<bool>;
    fn collection_name(&self) -> &str;
}

pub struct QdrantStorage {
    client: Qdrant,
    collection: String,
}

impl QdrantStorage {
    pub fn new(url: &str, api_key: Option<&str>, collection: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .api_key(api_key.map(str::to_string))
            .build()?;

        Ok(Self {
            client,
            collection: collection.to_string(),
        })
    }

    fn payload_string(payload: &HashMap<String, QdrantValue>, key: &str) -> String {
        match payload.get(key).and_then(|value| value.kind.as_ref()) {
            Some(Kind::StringValue(s)) => s.clone(),
            _ => String::new(),
        }
    }

    fn payload_usize(payload: &HashMap<String, QdrantValue>, key: &str) -> usize {
        match payload.get(key).and_then(|value| value.kind.as_ref()) {
            Some(Kind::IntegerValue(n)) => usize::try_from(*n).unwrap_or_default(),
            Some(Kind::DoubleValue(n)) => *n as usize,
            _ => 0,
        }
    }

    fn to_point(chunk: ChunkRecord) -> PointStruct {
        let mut payload = Payload::new();
        payload.insert("source", chunk.source);
        payload.insert("chunk_index", chunk.chunk_index as i64);
        payload.insert("start", chunk.start as i64);
        payload.insert("end", chunk.end as i64);
        payload.insert("text", chunk.text);

        PointStruct::new(chunk.id.to_string(), chunk.embedding, payload)
    }
}

#[async_trait]
impl VectorStorage for QdrantStorage {
    async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        if self.client.collection_exists(&self.collection).await? {
            debug!(collection = %self.collection, "Qdrant collection already exists");
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await?;

        info!(collection = %self.collection, dimension, "Created Qdrant collection");
        Ok(())
    }

    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let count = chunks.len();
        let points: Vec<PointStruct> = chunks.into_iter().map(Self::to_point).collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await?;

        debug!(collection = %self.collection, count, "Upserted chunks");
        Ok(())
    }

    async fn delete_source(&self, source: &str) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(Filter::must([Condition::matches("source", source.to_string())]))
                    .wait(true),
            )
            .await?;

        debug!(collection = %self.collection, source, "Deleted chunks of source");
        Ok(())
    }

    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query.embedding, query.top_k as u64)
                    .with_payload(true),
            )
            .await?;

        let results = response
            .result
            .into_iter()
            .map(|scored| {
                let id = scored
                    .id
                    .as_ref()
                    .and_then(|pid| match &pid.point_id_options {
                        Some(PointIdOptions::Uuid(s)) => Uuid::parse_str(s).ok(),
                        _ => None,
                    })
                    .unwrap_or_default();

                SearchResult {
                    chunk: ChunkRecord {
                        id,
                        source: Self::payload_string(&scored.payload, "source"),
                        chunk_index: Self::payload_usize(&scored.payload, "chunk_index"),
                        start: Self::payload_usize(&scored.payload, "start"),
                        end: Self::payload_usize(&scored.payload, "end"),
                        text: Self::payload_string(&scored.payload, "text"),
                        embedding: Vec::new(),
                    },
                    score: scored.score,
                }
            })
            .collect();

        Ok(results)
    }

    async fn count(&self) -> Result<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn health_check(&self) -> Result<bool> {
        self.client.health_check().await?;
        Ok(true)
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }
}

/// Process-local store with brute-force cosine search, for development
/// without a Qdrant instance and for tests.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    chunks: RwLock<HashMap<Uuid, ChunkRecord>>,
    collection: String,
}

impl InMemoryStorage {
    pub fn new(collection: &str) -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            collection: collection.to_string(),
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStorage for InMemoryStorage {
    async fn ensure_collection(&self, _dimension: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<()> {
        let mut stored = self.chunks.write().await;
        for chunk in chunks {
            stored.insert(chunk.id, chunk);
        }
        Ok(())
    }

    async fn delete_source(&self, source: &str) -> Result<()> {
        self.chunks.write().await.retain(|_, chunk| chunk.source != source);
        Ok(())
    }

    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchResult>> {
        let stored = self.chunks.read().await;
        let mut results: Vec<SearchResult> = stored
            .values()
            .map(|chunk| SearchResult {
                score: cosine_similarity(&query.embedding, &chunk.embedding),
                chunk: ChunkRecord {
                    embedding: Vec::new(),
                    ..chunk.clone()
                },
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(query.top_k);
        Ok(results)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.chunks.read().await.len() as u64)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }
}
