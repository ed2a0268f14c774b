use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use crate::config::{CacheConfig, KeyNormalization};
use crate::query::Source;
use crate::{RagError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub answer: String,
    pub sources: Vec<Source>,
    pub tokens_used: u32,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    /// Removes every key starting with `prefix`, returning how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
    async fn ping(&self) -> Result<()>;
}

pub struct RedisCacheStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisCacheStore {
    /// Parses the URL only; the connection is opened on first use.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = self.client.get_connection_manager().await?;
                info!("Connected to Redis");
                Ok::<_, RagError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn.keys(format!("{}*", prefix)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process store. Expired entries are dropped when read.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    // `None` expiry: the TTL is past what `Instant` can represent.
    entries: DashMap<String, (String, Option<Instant>)>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1.map_or(true, |expiry| expiry > now) => {
                return Ok(Some(entry.0.clone()))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let expiry = Instant::now().checked_add(ttl);
        self.entries.insert(key.to_string(), (value, expiry));
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Answer cache keyed by normalized question. Failures and slow operations
/// degrade to a miss or a skipped write.
pub struct AnswerCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    prefix: String,
    normalization: KeyNormalization,
    operation_timeout: Duration,
}

impl AnswerCache {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(config.ttl_secs),
            prefix: config.key_prefix.clone(),
            normalization: config.normalization,
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn normalize(&self, question: &str) -> String {
        let mut normalized = if self.normalization.trim {
            question.trim().to_string()
        } else {
            question.to_string()
        };
        if self.normalization.collapse_whitespace {
            normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        if self.normalization.case_fold {
            normalized = normalized.to_lowercase();
        }
        normalized
    }

    pub fn key(&self, question: &str) -> String {
        let digest = Sha256::digest(self.normalize(question).as_bytes());
        format!("{}{}", self.prefix, hex::encode(digest))
    }

    pub async fn get(&self, question: &str) -> Option<CachedAnswer> {
        let key = self.key(question);
        let raw = match tokio::time::timeout(self.operation_timeout, self.store.get(&key)).await {
            Ok(Ok(raw)) => raw?,
            Ok(Err(e)) => {
                warn!(error = %e, "Cache read failed, treating as miss");
                return None;
            }
            Err(_) => {
                warn!(timeout_ms = self.operation_timeout.as_millis() as u64, "Cache read timed out, treating as miss");
                return None;
            }
        };

        match serde_json::from_str::<CachedAnswer>(&raw) {
            Ok(answer) => {
                debug!(key = %key, "Cache hit");
                Some(answer)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }

    pub async fn put(&self, question: &str, answer: &CachedAnswer) {
        self.put_with_ttl(question, answer, self.ttl).await
    }

    /// Overwrites any entry under the same normalized question.
    pub async fn put_with_ttl(&self, question: &str, answer: &CachedAnswer, ttl: Duration) {
        let value = match serde_json::to_string(answer) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to serialize answer for cache");
                return;
            }
        };

        let key = self.key(question);
        match tokio::time::timeout(self.operation_timeout, self.store.set(&key, value, ttl)).await {
            Ok(Ok(())) => debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached answer"),
            Ok(Err(e)) => warn!(error = %e, "Cache write failed"),
            Err(_) => warn!("Cache write timed out"),
        }
    }

    pub async fn clear(&self) -> Result<u64> {
        let removed = self.store.delete_prefix(&self.prefix).await?;
        info!(removed, prefix = %self.prefix, "Cleared answer cache");
        Ok(removed)
    }

    pub async fn health_check(&self) -> bool {
        match tokio::time::timeout(self.operation_timeout, self.store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Cache health check failed");
                false
            }
            Err(_) => false,
        }
    }
}
