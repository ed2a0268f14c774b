use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;
use crate::query::Source;
use crate::{RagError, Result};

pub const DEFAULT_HISTORY_LIMIT: i64 = 10;
pub const MAX_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: Uuid,
    pub question: String,
    pub answer: String,
    pub tokens_used: u32,
    pub response_time_ms: u64,
    pub cached: bool,
    pub sources: Vec<Source>,
    pub created_at: DateTime<Utc>,
}

impl QueryRecord {
    pub fn new(
        question: impl Into<String>,
        answer: impl Into<String>,
        tokens_used: u32,
        response_time_ms: u64,
        cached: bool,
        sources: Vec<Source>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.into(),
            answer: answer.into(),
            tokens_used,
            response_time_ms,
            cached,
            sources,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_hit_ratio: f64,
    pub average_response_time_ms: f64,
    pub total_tokens: u64,
}

impl QueryStats {
    fn from_totals(total_queries: u64, cache_hits: u64, response_time_sum: f64, total_tokens: u64) -> Self {
        let (cache_hit_ratio, average_response_time_ms) = if total_queries == 0 {
            (0.0, 0.0)
        } else {
            (
                cache_hits as f64 / total_queries as f64,
                response_time_sum / total_queries as f64,
            )
        };

        Self {
            total_queries,
            cache_hits,
            cache_hit_ratio,
            average_response_time_ms,
            total_tokens,
        }
    }
}

/// `limit` must be within 1..=100 and `offset` non-negative.
pub fn validate_page(limit: i64, offset: i64) -> Result<()> {
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(RagError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_HISTORY_LIMIT
        )));
    }
    if offset < 0 {
        return Err(RagError::Validation("offset must not be negative".to_string()));
    }
    Ok(())
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Creates whatever schema the store needs. Idempotent.
    async fn migrate(&self) -> Result<()>;
    async fn append(&self, record: &QueryRecord) -> Result<()>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<QueryRecord>>;
    async fn stats(&self) -> Result<QueryStats>;
    async fn health_check(&self) -> bool;
    async fn close(&self);
}

pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    /// Builds the pool without connecting; connections open on first use.
    /// `acquire_timeout` bounds every call while the database is unreachable.
    pub fn connect_lazy(database_url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    fn record_from_row(row: &PgRow) -> Result<QueryRecord> {
        let tokens_used: i32 = row.try_get("tokens_used")?;
        let response_time_ms: i64 = row.try_get("response_time_ms")?;
        let Json(sources): Json<Vec<Source>> = row.try_get("sources")?;

        Ok(QueryRecord {
            id: row.try_get("id")?,
            question: row.try_get("question")?,
            answer: row.try_get("answer")?,
            tokens_used: u32::try_from(tokens_used).unwrap_or_default(),
            response_time_ms: u64::try_from(response_time_ms).unwrap_or_default(),
            cached: row.try_get("cached")?,
            sources,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS query_history (
                id UUID PRIMARY KEY,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                tokens_used INT NOT NULL DEFAULT 0,
                response_time_ms BIGINT NOT NULL DEFAULT 0,
                cached BOOLEAN NOT NULL DEFAULT FALSE,
                sources JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_query_history_created_at_desc
             ON query_history (created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        info!("query_history table ready");
        Ok(())
    }

    async fn append(&self, record: &QueryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO query_history
                (id, question, answer, tokens_used, response_time_ms, cached, sources, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(&record.question)
        .bind(&record.answer)
        .bind(i32::try_from(record.tokens_used).unwrap_or(i32::MAX))
        .bind(i64::try_from(record.response_time_ms).unwrap_or(i64::MAX))
        .bind(record.cached)
        .bind(Json(&record.sources))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<QueryRecord>> {
        validate_page(limit, offset)?;

        let rows = sqlx::query(
            "SELECT id, question, answer, tokens_used, response_time_ms, cached, sources, created_at
             FROM query_history
             ORDER BY created_at DESC
             LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn stats(&self) -> Result<QueryStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total_queries,
                COUNT(*) FILTER (WHERE cached) AS cache_hits,
                COALESCE(SUM(response_time_ms), 0)::float8 AS response_time_sum,
                COALESCE(SUM(tokens_used), 0)::bigint AS total_tokens
             FROM query_history",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_queries: i64 = row.try_get("total_queries")?;
        let cache_hits: i64 = row.try_get("cache_hits")?;
        let response_time_sum: f64 = row.try_get("response_time_sum")?;
        let total_tokens: i64 = row.try_get("total_tokens")?;

        Ok(QueryStats::from_totals(
            total_queries.max(0) as u64,
            cache_hits.max(0) as u64,
            response_time_sum,
            total_tokens.max(0) as u64,
        ))
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Process-local history, kept in insertion order.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: RwLock<Vec<QueryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, record: &QueryRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<QueryRecord>> {
        validate_page(limit, offset)?;

        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<QueryStats> {
        let records = self.records.read().await;
        let cache_hits = records.iter().filter(|r| r.cached).count() as u64;
        let response_time_sum: f64 = records.iter().map(|r| r.response_time_ms as f64).sum();
        let total_tokens: u64 = records.iter().map(|r| u64::from(r.tokens_used)).sum();

        Ok(QueryStats::from_totals(
            records.len() as u64,
            cache_hits,
            response_time_sum,
            total_tokens,
        ))
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn close(&self) {}
}
