use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use crate::config::{LlmConfig, LlmProviderKind};
use crate::retrieval::RetrievedChunk;
use crate::{RagError, Result};

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-haiku-20240307";

pub const OPENAI_API_BASE: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";

pub const NO_CONTEXT: &str = "No context found.";
const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a support assistant for a product knowledge base.

Answer user questions using the context provided from the knowledge base.

Rules:
1. Answer only from the provided context.
2. If the context does not contain the answer, say plainly: \"Sorry, I could not find information on this in the knowledge base.\"
3. Keep answers short and to the point.
4. If the question touches several topics, structure the answer.
5. Never make up information that is not in the context.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub tokens_used: u32,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_message: &str, max_tokens: u32) -> Result<Generation>;

    fn name(&self) -> &str;

    fn model(&self) -> &str;
}

pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    let timeout = Duration::from_secs(config.timeout_secs);

    let provider: Arc<dyn LlmProvider> = match config.provider {
        LlmProviderKind::Anthropic => {
            let api_key = required_key(config.anthropic_api_key.as_deref(), "Anthropic")?;
            let mut provider = AnthropicProvider::new(api_key, timeout)?;
            if let Some(model) = &config.model {
                provider = provider.with_model(model.clone());
            }
            if let Some(base_url) = &config.base_url {
                provider = provider.with_api_base(base_url.clone());
            }
            Arc::new(provider)
        }
        LlmProviderKind::OpenAI => {
            let api_key = required_key(config.openai_api_key.as_deref(), "OpenAI")?;
            let mut provider = OpenAiProvider::new(api_key, timeout)?;
            if let Some(model) = &config.model {
                provider = provider.with_model(model.clone());
            }
            if let Some(base_url) = &config.base_url {
                provider = provider.with_api_base(base_url.clone());
            }
            Arc::new(provider)
        }
    };

    info!(provider = provider.name(), model = provider.model(), "LLM provider selected");
    Ok(provider)
}

fn required_key(key: Option<&str>, vendor: &str) -> Result<String> {
    match key.map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(RagError::InvalidConfiguration(format!("{} API key is not set", vendor))),
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RagError::InvalidConfiguration(format!("failed to build HTTP client: {}", e)))
}

// 429 and quota codes are not worth retrying
fn classify_failure(provider: &str, status: StatusCode, body: &str) -> RagError {
    let detail = serde_json::from_str::<serde_json::Value>(body).ok();
    let error_kind = detail
        .as_ref()
        .and_then(|value| value.get("error"))
        .map(|err| {
            let code = err.get("code").and_then(|c| c.as_str()).unwrap_or_default();
            let kind = err.get("type").and_then(|t| t.as_str()).unwrap_or_default();
            format!("{} {}", code, kind)
        })
        .unwrap_or_default();

    let quota = status == StatusCode::TOO_MANY_REQUESTS
        || error_kind.contains("insufficient_quota")
        || error_kind.contains("rate_limit");

    let message = format!("{} returned {}: {}", provider, status, body);
    if quota {
        RagError::LlmQuotaExceeded(message)
    } else {
        RagError::LlmUnavailable(message)
    }
}

fn transport_error(provider: &str, err: reqwest::Error) -> RagError {
    RagError::LlmUnavailable(format!("{} request failed: {}", provider, err))
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            api_base: ANTHROPIC_API_BASE.to_string(),
        })
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn generate(&self, system_prompt: &str, user_message: &str, max_tokens: u32) -> Result<Generation> {
        let request = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_message}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(self.name(), status, &body));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| RagError::LlmUnavailable(format!("malformed Anthropic response: {}", e)))?;

        let text = parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| RagError::LlmUnavailable("Anthropic response had no text content".to_string()))?;

        debug!(
            model = %self.model,
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            "Anthropic generation complete"
        );

        Ok(Generation {
            text,
            tokens_used: parsed.usage.input_tokens + parsed.usage.output_tokens,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            model: DEFAULT_OPENAI_MODEL.to_string(),
            api_base: OPENAI_API_BASE.to_string(),
        })
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: ChatUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate(&self, system_prompt: &str, user_message: &str, max_tokens: u32) -> Result<Generation> {
        let request = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message},
            ],
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(self.name(), status, &body));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| RagError::LlmUnavailable(format!("malformed OpenAI response: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RagError::LlmUnavailable("OpenAI response had no choices".to_string()))?;

        debug!(model = %self.model, total_tokens = parsed.usage.total_tokens, "OpenAI generation complete");

        Ok(Generation {
            text,
            tokens_used: parsed.usage.total_tokens,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    max_tokens: u32,
    retry_backoff: Duration,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: config.max_tokens,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn build_prompt(question: &str, chunks: &[RetrievedChunk]) -> String {
        let context = if chunks.is_empty() {
            NO_CONTEXT.to_string()
        } else {
            chunks
                .iter()
                .map(|chunk| format!("[Source: {}]\n{}", chunk.document, chunk.text))
                .collect::<Vec<_>>()
                .join(CONTEXT_SEPARATOR)
        };

        format!(
            "Knowledge base context:\n{}\n\nUser question: {}\n\nAnswer the question using only the information from the context.",
            context, question
        )
    }

    // One retry, and only for LlmUnavailable
    pub async fn generate(&self, question: &str, chunks: &[RetrievedChunk]) -> Result<Generation> {
        let prompt = Self::build_prompt(question, chunks);
        let start = Instant::now();

        let result = match self.attempt(&prompt).await {
            Err(RagError::LlmUnavailable(reason)) => {
                warn!(provider = self.provider.name(), reason = %reason, backoff_ms = self.retry_backoff.as_millis() as u64, "LLM unavailable, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(&prompt).await
            }
            other => other,
        };

        match &result {
            Ok(generation) => info!(
                provider = self.provider.name(),
                tokens = generation.tokens_used,
                response_time_ms = start.elapsed().as_millis() as u64,
                "Generated answer"
            ),
            Err(e) => error!(provider = self.provider.name(), error = %e, "Error generating answer"),
        }

        result
    }

    async fn attempt(&self, prompt: &str) -> Result<Generation> {
        self.provider
            .generate(&self.system_prompt, prompt, self.max_tokens)
            .await
    }
}
