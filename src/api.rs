use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, MatchedPath, Multipart, Query, State,
    },
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use crate::cache::AnswerCache;
use crate::history::{HistoryStore, QueryRecord, QueryStats, DEFAULT_HISTORY_LIMIT};
use crate::ingestion::{Document, IngestionPipeline};
use crate::metrics::Metrics;
use crate::query::{Answer, QueryProcessor};
use crate::retrieval::Retriever;
use crate::{RagError, Result};

// multipart framing on top of the file limit
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentUploadResponse {
    pub message: String,
    pub filename: String,
    pub chunks_created: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub queries: QueryStats,
    pub documents_indexed: u64,
    pub collection: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub vector_store: String,
    pub cache: String,
    pub database: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub services: ServiceHealth,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct FilenameSanitizer {
    allowed: Regex,
    disallowed_char: Regex,
}

impl FilenameSanitizer {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| RagError::InvalidConfiguration(e.to_string()))
        };
        Ok(Self {
            allowed: compile(r"^[\w\-. ]+$")?,
            disallowed_char: compile(r"[^\w\-.]")?,
        })
    }

    /// Strips directory components; if anything outside `[\w\-. ]` remains,
    /// those characters in the stem become `_`.
    pub fn sanitize(&self, filename: &str) -> String {
        let base = filename
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or_default();
        if self.allowed.is_match(base) {
            return base.to_string();
        }

        let (stem, extension) = match base.rfind('.') {
            Some(dot) if dot > 0 => base.split_at(dot),
            _ => (base, ""),
        };
        format!("{}{}", self.disallowed_char.replace_all(stem, "_"), extension)
    }
}

pub struct AppState {
    pub processor: Arc<QueryProcessor>,
    pub ingestion: Arc<IngestionPipeline>,
    pub retriever: Arc<Retriever>,
    pub cache: Arc<AnswerCache>,
    pub history: Arc<dyn HistoryStore>,
    pub metrics: Arc<Metrics>,
    pub max_upload_bytes: usize,
    pub sanitizer: FilenameSanitizer,
}

impl AppState {
    pub fn new(
        processor: Arc<QueryProcessor>,
        ingestion: Arc<IngestionPipeline>,
        retriever: Arc<Retriever>,
        cache: Arc<AnswerCache>,
        history: Arc<dyn HistoryStore>,
        metrics: Arc<Metrics>,
        max_upload_bytes: usize,
    ) -> Result<Self> {
        Ok(Self {
            processor,
            ingestion,
            retriever,
            cache,
            history,
            metrics,
            max_upload_bytes,
            sanitizer: FilenameSanitizer::new()?,
        })
    }
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;
    let state = Arc::new(state);

    Router::new()
        .route("/health", get(health_check))
        .route("/ask", post(ask_question))
        .route("/documents", post(upload_document))
        .route("/history", get(get_history))
        .route("/stats", get(get_stats))
        .route("/metrics", get(get_metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(state.clone(), logging_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn status_label(healthy: bool) -> String {
    let label = if healthy { "healthy" } else { "unhealthy" };
    label.to_string()
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (vector_store, cache, database) = futures::join!(
        state.retriever.health_check(),
        state.cache.health_check(),
        state.history.health_check(),
    );

    state.metrics.set_service_up("vector_store", vector_store);
    state.metrics.set_service_up("cache", cache);
    state.metrics.set_service_up("database", database);

    let status = if vector_store && cache && database {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        services: ServiceHealth {
            vector_store: status_label(vector_store),
            cache: status_label(cache),
            database: status_label(database),
        },
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn ask_question(
    State(state): State<Arc<AppState>>,
    request: std::result::Result<Json<AskRequest>, JsonRejection>,
) -> ApiResult<Answer> {
    let Json(request) = request.map_err(|rejection| {
        warn!(error = %rejection, "Rejected /ask body");
        validation_error(&rejection.body_text())
    })?;

    info!(question_chars = request.question.chars().count(), "Processing question");

    match state.processor.process_query(&request.question).await {
        Ok(answer) => Ok(Json(answer)),
        Err(e) => {
            error!(error = %e, "Question processing failed");
            Err(error_response(&e))
        }
    }
}

async fn upload_document(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<DocumentUploadResponse> {
    let (raw_filename, content) = loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return Err(validation_error("Multipart field 'file' is required"));
            }
            Err(e) => {
                return Err(validation_error(&format!("Invalid multipart body: {}", e)));
            }
        };

        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().map(str::to_string).unwrap_or_default();
        let bytes = field.bytes().await.map_err(|e| {
            validation_error(&format!("Failed to read uploaded file: {}", e))
        })?;
        break (filename, bytes);
    };

    if raw_filename.trim().is_empty() {
        return Err(validation_error("Filename is required"));
    }
    if !state.ingestion.is_supported(&raw_filename) {
        return Err(validation_error("Only .txt and .md files are supported"));
    }

    let filename = state.sanitizer.sanitize(&raw_filename);

    if content.len() > state.max_upload_bytes {
        return Err(validation_error(&format!(
            "File too large. Maximum size is {} MB",
            state.max_upload_bytes / (1024 * 1024)
        )));
    }
    if content.is_empty() {
        return Err(validation_error("File is empty"));
    }
    let text = match String::from_utf8(content.to_vec()) {
        Ok(text) => text,
        Err(_) => return Err(validation_error("File must be UTF-8 encoded")),
    };

    info!(filename = %filename, bytes = content.len(), "Uploading document");

    let document = Document::new(filename.clone(), text);
    let result = state.ingestion.ingest(&document).await;
    state.metrics.record_upload(result.is_ok());

    match result {
        Ok(chunks_created) => {
            if let Ok(count) = state.retriever.document_count().await {
                state.metrics.set_documents_indexed(count);
            }
            Ok(Json(DocumentUploadResponse {
                message: "Document uploaded successfully".to_string(),
                filename,
                chunks_created,
            }))
        }
        Err(e) => {
            error!(filename = %filename, error = %e, "Failed to index document");
            Err(error_response(&e))
        }
    }
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    params: std::result::Result<Query<HistoryParams>, QueryRejection>,
) -> ApiResult<Vec<QueryRecord>> {
    let Query(params) = params.map_err(|rejection| validation_error(&rejection.body_text()))?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let offset = params.offset.unwrap_or(0);

    state
        .history
        .list(limit, offset)
        .await
        .map(Json)
        .map_err(|e| {
            if !matches!(e, RagError::Validation(_)) {
                error!(error = %e, "Failed to load history");
            }
            error_response(&e)
        })
}

/// Unreachable backends report zeros rather than failing the request.
async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let (queries, documents_indexed) =
        futures::join!(state.history.stats(), state.retriever.document_count());

    let queries = queries.unwrap_or_else(|e| {
        warn!(error = %e, "Query statistics unavailable");
        QueryStats::default()
    });
    let documents_indexed = match documents_indexed {
        Ok(count) => {
            state.metrics.set_documents_indexed(count);
            count
        }
        Err(e) => {
            warn!(error = %e, "Document count unavailable");
            0
        }
    };

    Json(StatsResponse {
        queries,
        documents_indexed,
        collection: state.retriever.collection_name().to_string(),
    })
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok((content_type, body)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            error_response(&e).into_response()
        }
    }
}

fn validation_error(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    create_error_response(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn error_response(err: &RagError) -> (StatusCode, Json<ErrorResponse>) {
    create_error_response(err.status_code(), err.code(), &err.to_string())
}

fn create_error_response(
    status: StatusCode,
    code: &str,
    message: &str,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

// Middleware for request logging and metrics
pub async fn logging_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();
    state
        .metrics
        .record_request(method.as_str(), &endpoint, status.as_u16(), latency);

    info!(
        method = %method,
        uri = %uri,
        status = %status,
        latency_ms = %latency.as_millis(),
        "Request processed"
    );

    response
}
