use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowscope_core::config::{BackendKind, Config};
use flowscope_core::error::{FlowscopeError, Result};
use flowscope_core::model::raw::RawTrace;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub mod jaeger;
pub mod tempo;

pub use jaeger::JaegerBackend;
pub use tempo::TempoBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub service: Option<String>,
    pub limit: usize,
}

/// Source of raw traces. Implementations must tolerate partial payloads;
/// validation happens in the normalizer.
#[async_trait]
pub trait TraceBackend: Send + Sync {
    /// Base URL, for logs and status output.
    fn endpoint(&self) -> &str;

    async fn query_traces(&self, query: &TraceQuery) -> Result<Vec<RawTrace>>;
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl BackendConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            kind: cfg.backend_kind,
            url: cfg.backend_url.clone(),
            headers: cfg.backend_headers.clone(),
            timeout: cfg.backend_timeout,
        }
    }
}

pub fn build_backend(cfg: &BackendConfig) -> Result<Arc<dyn TraceBackend>> {
    let client = http_client(&cfg.headers, cfg.timeout)?;
    Ok(match cfg.kind {
        BackendKind::Jaeger => Arc::new(JaegerBackend::new(client, &cfg.url)),
        BackendKind::Tempo => Arc::new(TempoBackend::new(client, &cfg.url)),
    })
}

fn http_client(headers: &[(String, String)], timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(build_http_headers(headers))
        .build()
        .map_err(|e| FlowscopeError::Backend(format!("failed to build http client: {e}")))
}

fn build_http_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::try_from(k.as_str());
        let value = HeaderValue::try_from(v.as_str());
        match (name, value) {
            (Ok(name), Ok(value)) => {
                out.insert(name, value);
            }
            _ => {
                tracing::warn!(header = %k, "ignored invalid backend header");
            }
        }
    }
    out
}

pub(crate) fn request_error(url: &str, err: reqwest::Error) -> FlowscopeError {
    FlowscopeError::Backend(format!("GET {url}: {err}"))
}

pub(crate) async fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(FlowscopeError::Backend(format!(
        "GET {url} returned {status}: {}",
        body.chars().take(200).collect::<String>()
    )))
}
