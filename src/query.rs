use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use crate::cache::{AnswerCache, CachedAnswer};
use crate::history::{HistoryStore, QueryRecord};
use crate::llm::{Generation, LlmClient};
use crate::metrics::Metrics;
use crate::retrieval::{RetrievedChunk, Retriever};
use crate::{RagError, Result};

pub const SOURCE_PREVIEW_CHARS: usize = 200;

/// A citation: the document a chunk came from and a preview of its text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub document: String,
    pub chunk: String,
}

impl Source {
    pub fn from_chunk(chunk: &RetrievedChunk) -> Self {
        Self {
            document: chunk.document.clone(),
            chunk: preview(&chunk.text, SOURCE_PREVIEW_CHARS),
        }
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
    pub tokens_used: u32,
    pub response_time_ms: u64,
    pub cached: bool,
}

/// Answers questions: cache first, then retrieval and generation.
pub struct QueryProcessor {
    cache: Arc<AnswerCache>,
    retriever: Arc<Retriever>,
    llm: Arc<LlmClient>,
    history: Arc<dyn HistoryStore>,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
    history_timeout: Duration,
    max_question_length: usize,
}

impl QueryProcessor {
    pub fn new(
        cache: Arc<AnswerCache>,
        retriever: Arc<Retriever>,
        llm: Arc<LlmClient>,
        history: Arc<dyn HistoryStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            retriever,
            llm,
            history,
            metrics,
            request_timeout: Duration::from_secs(60),
            history_timeout: Duration::from_secs(1),
            max_question_length: 1000,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_question_length(mut self, max_chars: usize) -> Self {
        self.max_question_length = max_chars;
        self
    }

    pub fn with_history_timeout(mut self, timeout: Duration) -> Self {
        self.history_timeout = timeout;
        self
    }

    pub fn validate<'a>(&self, question: &'a str) -> Result<&'a str> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::Validation("question must not be empty".to_string()));
        }
        let length = question.chars().count();
        if length > self.max_question_length {
            return Err(RagError::Validation(format!(
                "question is {} characters long, the maximum is {}",
                length, self.max_question_length
            )));
        }
        Ok(question)
    }

    pub async fn process_query(&self, question: &str) -> Result<Answer> {
        let start = Instant::now();
        let question = self.validate(question)?;

        let cached = self.cache.get(question).await;
        self.metrics.record_cache_lookup(cached.is_some());

        if let Some(hit) = cached {
            let response_time_ms = start.elapsed().as_millis() as u64;
            info!(response_time_ms, "Answered from cache");

            // No tokens were spent on this request.
            self.record(QueryRecord::new(
                question,
                hit.answer.clone(),
                0,
                response_time_ms,
                true,
                hit.sources.clone(),
            ))
            .await;

            return Ok(Answer {
                answer: hit.answer,
                sources: hit.sources,
                tokens_used: hit.tokens_used,
                response_time_ms,
                cached: true,
            });
        }

        let (chunks, generation) =
            match tokio::time::timeout(self.request_timeout, self.retrieve_and_generate(question)).await {
                Ok(result) => result?,
                Err(_) => {
                    let secs = self.request_timeout.as_secs();
                    error!(timeout_secs = secs, "Question timed out before an answer was generated");
                    return Err(RagError::Timeout(secs));
                }
            };

        let sources: Vec<Source> = chunks.iter().map(Source::from_chunk).collect();
        let response_time_ms = start.elapsed().as_millis() as u64;

        self.cache
            .put(
                question,
                &CachedAnswer {
                    answer: generation.text.clone(),
                    sources: sources.clone(),
                    tokens_used: generation.tokens_used,
                },
            )
            .await;

        self.record(QueryRecord::new(
            question,
            generation.text.clone(),
            generation.tokens_used,
            response_time_ms,
            false,
            sources.clone(),
        ))
        .await;

        info!(
            chunks = chunks.len(),
            tokens = generation.tokens_used,
            response_time_ms,
            "Answered question"
        );

        Ok(Answer {
            answer: generation.text,
            sources,
            tokens_used: generation.tokens_used,
            response_time_ms,
            cached: false,
        })
    }

    async fn retrieve_and_generate(&self, question: &str) -> Result<(Vec<RetrievedChunk>, Generation)> {
        let searched = self.retriever.search(question, self.retriever.top_k()).await;
        self.metrics.record_search(searched.is_ok());
        let chunks = searched?;
        if chunks.is_empty() {
            warn!("No context found for question");
        }

        let start = Instant::now();
        let generated = self.llm.generate(question, &chunks).await;
        self.metrics.record_llm(
            self.llm.provider_name(),
            generated.as_ref().map_or(0, |g| g.tokens_used),
            start.elapsed(),
            generated.is_ok(),
        );
        Ok((chunks, generated?))
    }

    // Best-effort: a slow or failing history store never fails the answer.
    async fn record(&self, record: QueryRecord) {
        match tokio::time::timeout(self.history_timeout, self.history.append(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to save query history"),
            Err(_) => warn!(
                timeout_ms = self.history_timeout.as_millis() as u64,
                "Saving query history timed out"
            ),
        }
    }
}
