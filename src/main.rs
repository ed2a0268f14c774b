use anyhow::Context;
use clap::Parser;
use faq_rag::{
    api::{create_router, AppState},
    cache::{AnswerCache, CacheStore, MemoryCacheStore, RedisCacheStore},
    config::{CacheBackend, HistoryBackend, RagConfig, VectorBackend},
    embedding,
    history::{HistoryStore, MemoryHistoryStore, PgHistoryStore},
    ingestion::{Chunker, IngestionPipeline},
    llm::{build_provider, LlmClient},
    metrics::Metrics,
    query::QueryProcessor,
    retrieval::Retriever,
    storage::{InMemoryStorage, QdrantStorage, VectorStorage},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{self, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "faq-rag", version, about = "Retrieval-augmented FAQ answering service")]
struct Args {
    /// TOML configuration file layered over the built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Directory of .txt/.md files indexed at startup
    #[arg(long)]
    documents_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args = Args::parse();

    info!("Starting FAQ-RAG service...");

    // Load configuration
    let mut config = RagConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.documents_dir {
        config.ingestion.documents_dir = Some(dir);
    }

    // Collaborators
    let embedding_service = embedding::from_config(&config.embedding)
        .await
        .context("failed to initialize embedding service")?;

    let storage: Arc<dyn VectorStorage> = match config.storage.vector_backend {
        VectorBackend::Qdrant => Arc::new(QdrantStorage::new(
            &config.storage.qdrant_url,
            config.storage.qdrant_api_key.as_deref(),
            &config.storage.collection_name,
        )?),
        VectorBackend::Memory => Arc::new(InMemoryStorage::new(&config.storage.collection_name)),
    };

    let cache_store: Arc<dyn CacheStore> = match config.cache.backend {
        CacheBackend::Redis => Arc::new(RedisCacheStore::new(&config.cache.redis_url)?),
        CacheBackend::Memory => Arc::new(MemoryCacheStore::new()),
    };

    let history: Arc<dyn HistoryStore> = match config.storage.history_backend {
        HistoryBackend::Postgres => Arc::new(PgHistoryStore::connect_lazy(
            &config.storage.postgres_url,
            config.storage.postgres_max_connections,
            Duration::from_millis(config.storage.postgres_acquire_timeout_ms),
        )?),
        HistoryBackend::Memory => Arc::new(MemoryHistoryStore::new()),
    };

    let provider = build_provider(&config.llm)?;
    let metrics = Arc::new(Metrics::new()?);

    // Pipeline
    let retriever = Arc::new(Retriever::new(
        storage,
        embedding_service,
        config.retrieval.clone(),
    ));
    let cache = Arc::new(AnswerCache::new(cache_store, &config.cache));
    let llm = Arc::new(LlmClient::new(provider, &config.llm));

    let chunker = Chunker::new(config.ingestion.chunk_size, config.ingestion.chunk_overlap)?;
    let ingestion = Arc::new(
        IngestionPipeline::new(chunker, retriever.clone())
            .with_supported_formats(config.ingestion.supported_formats.clone()),
    );

    let processor = Arc::new(
        QueryProcessor::new(cache.clone(), retriever.clone(), llm, history.clone(), metrics.clone())
            .with_request_timeout(Duration::from_secs(config.server.request_timeout_secs))
            .with_history_timeout(Duration::from_millis(config.storage.history_timeout_ms))
            .with_max_question_length(config.server.max_question_length),
    );

    // Startup tasks; unavailable collaborators degrade instead of aborting
    if let Err(e) = retriever.prepare().await {
        warn!(error = %e, "Vector store not ready, collection will be ensured on first use");
    }
    if let Err(e) = history.migrate().await {
        warn!(error = %e, "History store not ready, schema not ensured");
    }
    if let Some(dir) = &config.ingestion.documents_dir {
        match ingestion.ingest_directory(dir).await {
            Ok(chunks) => info!(directory = ?dir, chunks, "Seeded knowledge base"),
            Err(e) => warn!(directory = ?dir, error = %e, "Failed to seed knowledge base"),
        }
    }

    // Create API router
    let app_state = AppState::new(
        processor,
        ingestion,
        retriever,
        cache,
        history.clone(),
        metrics,
        config.server.max_upload_bytes,
    )?;

    let app = create_router(app_state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("FAQ-RAG server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("Ask endpoint: http://{}/ask", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    history.close().await;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining in-flight requests");
}
