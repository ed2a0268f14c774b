use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use tokenizers::Tokenizer;
use hf_hub::api::tokio::Api;
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::{Result, RagError};

pub const DEFAULT_LOCAL_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
const OPENAI_API_BASE: &str = "https://api.openai.com";
// BERT position embeddings stop at 512
const MAX_SEQUENCE_LENGTH: usize = 512;

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
}

pub async fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingService>> {
    match config.provider {
        EmbeddingProvider::Candle => {
            let model = config.model.as_deref().unwrap_or(DEFAULT_LOCAL_MODEL);
            let service = CandleEmbedding::new(model, config.cache_size).await?;
            Ok(Arc::new(service))
        }
        EmbeddingProvider::OpenAI => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                RagError::InvalidConfiguration("OpenAI embedding requires an API key".to_string())
            })?;
            let model = config.model.clone().unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
            let dimension = config.dimension.unwrap_or(1536);
            let service = OpenAIEmbedding::with_model(api_key, model, dimension)
                .with_cache_size(config.cache_size)
                .with_batch_size(config.batch_size);
            Ok(Arc::new(service))
        }
    }
}

/// Bounded cache of recently computed embeddings. A capacity of zero
/// disables caching.
pub struct EmbeddingCache {
    entries: Option<Mutex<LruCache<u64, Vec<f32>>>>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn key(model: &str, text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        model.hash(&mut hasher);
        text.hash(&mut hasher);
        hasher.finish()
    }

    pub fn get(&self, key: u64) -> Option<Vec<f32>> {
        let entries = self.entries.as_ref()?;
        let mut guard = entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(&key).cloned()
    }

    pub fn insert(&self, key: u64, embedding: Vec<f32>) {
        if let Some(entries) = &self.entries {
            let mut guard = entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.put(key, embedding);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| {
            entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `texts` into cached hits and the texts still to compute, calls
/// `compute` once for the misses and stitches the results back in order.
async fn embed_with_cache<F, Fut>(
    cache: &EmbeddingCache,
    model: &str,
    texts: Vec<&str>,
    compute: F,
) -> Result<Vec<Vec<f32>>>
where
    F: FnOnce(Vec<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Vec<f32>>>>,
{
    let keys: Vec<u64> = texts.iter().map(|text| EmbeddingCache::key(model, text)).collect();
    let mut slots: Vec<Option<Vec<f32>>> = keys.iter().map(|key| cache.get(*key)).collect();

    let missing: Vec<String> = texts
        .iter()
        .zip(&slots)
        .filter(|(_, slot)| slot.is_none())
        .map(|(text, _)| text.to_string())
        .collect();

    if !missing.is_empty() {
        let computed = compute(missing).await?;
        let mut computed = computed.into_iter();
        for (slot, key) in slots.iter_mut().zip(&keys) {
            if slot.is_none() {
                let embedding = computed.next().ok_or_else(|| {
                    RagError::Embedding("embedding backend returned too few vectors".to_string())
                })?;
                cache.insert(*key, embedding.clone());
                *slot = Some(embedding);
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

struct BertEncoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl BertEncoder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self.tokenizer.encode(text, true)
            .map_err(|e| RagError::Tokenizer(format!("Tokenization failed: {}", e)))?;

        let ids = encoding.get_ids();
        let ids = &ids[..ids.len().min(MAX_SEQUENCE_LENGTH)];
        let mask = encoding.get_attention_mask();
        let mask = &mask[..mask.len().min(MAX_SEQUENCE_LENGTH)];

        let token_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let token_type_ids = token_ids.zeros_like()?;
        let attention_mask = Tensor::new(mask, &self.device)?.unsqueeze(0)?;

        let hidden = self.model.forward(&token_ids, &token_type_ids, Some(&attention_mask))?;

        // Mean pooling over tokens
        let (_batch, n_tokens, _hidden) = hidden.dims3()?;
        let pooled = (hidden.sum(1)? / (n_tokens as f64))?;
        let embedding = pooled.squeeze(0)?.to_vec1::<f32>()?;

        Ok(l2_normalize(embedding))
    }
}

fn l2_normalize(embedding: Vec<f32>) -> Vec<f32> {
    let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return embedding;
    }
    embedding.into_iter().map(|x| x / norm).collect()
}

pub struct CandleEmbedding {
    encoder: Arc<BertEncoder>,
    model_id: String,
    dimension: usize,
    cache: EmbeddingCache,
}

impl CandleEmbedding {
    pub async fn new(model_id: &str, cache_size: usize) -> Result<Self> {
        let device = Device::Cpu;

        let api = Api::new()?;
        let repo = api.model(model_id.to_string());

        let tokenizer_path = repo.get("tokenizer.json").await?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| RagError::Embedding(format!("Failed to load tokenizer: {}", e)))?;

        let config_path = repo.get("config.json").await?;
        let config_content = tokio::fs::read_to_string(config_path).await?;
        let config: Config = serde_json::from_str(&config_content)?;
        let raw: serde_json::Value = serde_json::from_str(&config_content)?;
        let dimension = raw
            .get("hidden_size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RagError::Embedding("model config has no hidden_size".to_string()))?
            as usize;

        let weights_path = repo.get("model.safetensors").await?;
        // SAFETY: the weights file is downloaded to the hub cache and not
        // modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;

        info!(model = model_id, dimension, "Loaded local embedding model");

        Ok(Self {
            encoder: Arc::new(BertEncoder { model, tokenizer, device }),
            model_id: model_id.to_string(),
            dimension,
            cache: EmbeddingCache::new(cache_size),
        })
    }

    async fn compute(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let encoder = Arc::clone(&self.encoder);
        tokio::task::spawn_blocking(move || {
            texts.iter().map(|text| encoder.encode(text)).collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| RagError::Embedding(format!("Embedding task failed: {}", e)))?
    }
}

#[async_trait]
impl EmbeddingService for CandleEmbedding {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(vec![text]).await?;
        embeddings.pop()
            .ok_or_else(|| RagError::Embedding("No embedding computed".to_string()))
    }

    async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        debug!(model = %self.model_id, batch_size = texts.len(), "Embedding batch locally");
        embed_with_cache(&self.cache, &self.model_id, texts, |missing| self.compute(missing)).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Serialize)]
struct OpenAIEmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAIEmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAIEmbedding {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    dimension: usize,
    batch_size: usize,
    cache: EmbeddingCache,
}

impl OpenAIEmbedding {
    pub fn new(api_key: String) -> Self {
        Self::with_model(api_key, DEFAULT_OPENAI_MODEL.to_string(), 1536)
    }

    pub fn with_model(api_key: String, model: String, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            api_base: OPENAI_API_BASE.to_string(),
            model,
            dimension,
            batch_size: 100,
            cache: EmbeddingCache::new(1000),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache = EmbeddingCache::new(cache_size);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn call_openai_api(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let request = OpenAIEmbeddingRequest {
            input: texts,
            model: self.model.clone(),
        };

        let response = self.client
            .post(format!("{}/v1/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::Embedding(format!("OpenAI API call failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RagError::Embedding(format!("OpenAI API error ({}): {}", status, error_text)));
        }

        let mut embedding_response: OpenAIEmbeddingResponse = response.json().await
            .map_err(|e| RagError::Embedding(format!("Failed to parse OpenAI response: {}", e)))?;

        if embedding_response.data.len() != expected {
            return Err(RagError::Embedding(format!(
                "OpenAI returned {} embeddings for {} inputs",
                embedding_response.data.len(),
                expected
            )));
        }

        embedding_response.data.sort_by_key(|d| d.index);
        Ok(embedding_response.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn compute(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            results.extend(self.call_openai_api(batch.to_vec()).await?);
        }
        Ok(results)
    }
}

#[async_trait]
impl EmbeddingService for OpenAIEmbedding {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(vec![text]).await?;
        embeddings.pop()
            .ok_or_else(|| RagError::Embedding("No embedding returned from OpenAI".to_string()))
    }

    async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        embed_with_cache(&self.cache, &self.model, texts, |missing| self.compute(missing)).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
