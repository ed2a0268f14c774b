use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;
use crate::Result;

const NAMESPACE: &str = "faq_rag";

pub struct Metrics {
    registry: Registry,
    pub requests: IntCounterVec,
    pub request_latency: HistogramVec,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub llm_tokens: IntCounterVec,
    pub llm_requests: IntCounterVec,
    pub llm_latency: HistogramVec,
    pub rag_searches: IntCounterVec,
    pub documents_indexed: IntGauge,
    pub document_uploads: IntCounterVec,
    pub service_up: IntGaugeVec,
}

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

impl Metrics {
    /// Collectors live in their own registry, so several instances can
    /// coexist in one process.
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let app_info = IntGaugeVec::new(
            Opts::new("app_info", "Application information"),
            &["version"],
        )?;
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Total number of requests"),
            &["method", "endpoint", "status"],
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("request_latency_seconds", "Request latency in seconds")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["method", "endpoint"],
        )?;
        let cache_hits = IntCounter::new("cache_hits_total", "Total number of cache hits")?;
        let cache_misses = IntCounter::new("cache_misses_total", "Total number of cache misses")?;
        let llm_tokens = IntCounterVec::new(
            Opts::new("llm_tokens_used_total", "Total number of LLM tokens used"),
            &["provider"],
        )?;
        let llm_requests = IntCounterVec::new(
            Opts::new("llm_requests_total", "Total number of LLM requests"),
            &["provider", "status"],
        )?;
        let llm_latency = HistogramVec::new(
            HistogramOpts::new("llm_latency_seconds", "LLM response latency in seconds")
                .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
            &["provider"],
        )?;
        let rag_searches = IntCounterVec::new(
            Opts::new("rag_searches_total", "Total number of vector searches"),
            &["status"],
        )?;
        let documents_indexed = IntGauge::new(
            "rag_documents_indexed",
            "Number of chunks indexed in the vector store",
        )?;
        let document_uploads = IntCounterVec::new(
            Opts::new("document_uploads_total", "Total number of document uploads"),
            &["status"],
        )?;
        let service_up = IntGaugeVec::new(
            Opts::new("service_up", "Service availability (1 = up, 0 = down)"),
            &["service"],
        )?;

        registry.register(Box::new(app_info.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(llm_tokens.clone()))?;
        registry.register(Box::new(llm_requests.clone()))?;
        registry.register(Box::new(llm_latency.clone()))?;
        registry.register(Box::new(rag_searches.clone()))?;
        registry.register(Box::new(documents_indexed.clone()))?;
        registry.register(Box::new(document_uploads.clone()))?;
        registry.register(Box::new(service_up.clone()))?;

        app_info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);

        Ok(Self {
            registry,
            requests,
            request_latency,
            cache_hits,
            cache_misses,
            llm_tokens,
            llm_requests,
            llm_latency,
            rag_searches,
            documents_indexed,
            document_uploads,
            service_up,
        })
    }

    pub fn record_request(&self, method: &str, endpoint: &str, status: u16, elapsed: Duration) {
        self.requests
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.request_latency
            .with_label_values(&[method, endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }
    }

    pub fn record_llm(&self, provider: &str, tokens: u32, elapsed: Duration, success: bool) {
        self.llm_tokens
            .with_label_values(&[provider])
            .inc_by(u64::from(tokens));
        self.llm_requests
            .with_label_values(&[provider, status(success)])
            .inc();
        self.llm_latency
            .with_label_values(&[provider])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_search(&self, success: bool) {
        self.rag_searches.with_label_values(&[status(success)]).inc();
    }

    pub fn record_upload(&self, success: bool) {
        self.document_uploads.with_label_values(&[status(success)]).inc();
    }

    pub fn set_documents_indexed(&self, count: u64) {
        self.documents_indexed.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn set_service_up(&self, service: &str, up: bool) {
        self.service_up.with_label_values(&[service]).set(i64::from(up));
    }

    /// Prometheus text exposition of every collector, with its content type.
    pub fn render(&self) -> Result<(String, String)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        let body = String::from_utf8_lossy(&buffer).into_owned();
        Ok((encoder.format_type().to_string(), body))
    }
}
