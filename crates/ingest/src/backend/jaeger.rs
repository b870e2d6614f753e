use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowscope_core::error::{FlowscopeError, Result};
use flowscope_core::model::raw::{AttributeMap, RawSpan, RawTrace};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{TraceBackend, TraceQuery, check_status, request_error};

/// Jaeger query service, `/api` JSON endpoints.
pub struct JaegerBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    #[serde(default)]
    data: Option<Vec<T>>,
    #[serde(default)]
    errors: Option<Vec<JaegerError>>,
}

#[derive(Debug, Deserialize)]
struct JaegerError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JaegerTrace {
    #[serde(rename = "traceID")]
    trace_id: String,
    #[serde(default)]
    spans: Vec<JaegerSpan>,
    #[serde(default)]
    processes: HashMap<String, JaegerProcess>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JaegerSpan {
    #[serde(rename = "traceID", default)]
    trace_id: Option<String>,
    #[serde(rename = "spanID", default)]
    span_id: Option<String>,
    #[serde(default)]
    operation_name: Option<String>,
    #[serde(default)]
    references: Vec<JaegerReference>,
    /// Microseconds since the epoch.
    #[serde(default)]
    start_time: Option<u64>,
    /// Microseconds.
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    tags: Vec<JaegerTag>,
    #[serde(rename = "processID", default)]
    process_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JaegerReference {
    #[serde(default)]
    ref_type: String,
    #[serde(rename = "spanID")]
    span_id: String,
}

#[derive(Debug, Deserialize)]
struct JaegerTag {
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JaegerProcess {
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    tags: Vec<JaegerTag>,
}

impl JaegerBackend {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get<T>(&self, url: &str, params: &[(&str, String)]) -> Result<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let resp = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;
        let envelope: Envelope<T> = check_status(url, resp)
            .await?
            .json()
            .await
            .map_err(|e| FlowscopeError::Backend(format!("decoding {url}: {e}")))?;
        if let Some(err) = envelope.errors.as_ref().and_then(|errs| errs.first()) {
            return Err(FlowscopeError::Backend(format!(
                "{url} reported error {}: {}",
                err.code, err.msg
            )));
        }
        Ok(envelope.data.unwrap_or_default())
    }

    async fn services(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/services", self.base_url);
        self.get(&url, &[]).await
    }
}

#[async_trait]
impl TraceBackend for JaegerBackend {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn query_traces(&self, query: &TraceQuery) -> Result<Vec<RawTrace>> {
        let services = match &query.service {
            Some(service) => vec![service.clone()],
            None => self.services().await?,
        };

        let url = format!("{}/api/traces", self.base_url);
        let mut traces = BTreeMap::new();
        for service in services {
            let params = [
                ("service", service.clone()),
                ("start", micros(query.start).to_string()),
                ("end", micros(query.end).to_string()),
                ("limit", query.limit.to_string()),
            ];
            let found: Vec<JaegerTrace> = self.get(&url, &params).await?;
            debug!(service = %service, traces = found.len(), "jaeger search");
            for trace in found {
                // The same trace comes back once per service it touches.
                traces
                    .entry(trace.trace_id.to_ascii_lowercase())
                    .or_insert_with(|| to_raw_trace(trace));
            }
        }
        Ok(traces.into_values().collect())
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn to_raw_trace(trace: JaegerTrace) -> RawTrace {
    let JaegerTrace {
        trace_id,
        spans,
        processes,
    } = trace;
    let spans = spans
        .into_iter()
        .map(|span| to_raw_span(span, &processes))
        .collect();
    RawTrace {
        trace_id: Some(trace_id),
        spans,
    }
}

fn to_raw_span(span: JaegerSpan, processes: &HashMap<String, JaegerProcess>) -> RawSpan {
    let mut attributes = AttributeMap::new();
    if let Some(process) = span.process_id.as_ref().and_then(|id| processes.get(id)) {
        attributes.extend(tags_to_map(&process.tags));
        if !process.service_name.is_empty() {
            attributes.insert(
                "service.name".to_string(),
                Value::String(process.service_name.clone()),
            );
        }
    }
    attributes.extend(tags_to_map(&span.tags));

    let parent = span
        .references
        .iter()
        .find(|r| r.ref_type.eq_ignore_ascii_case("CHILD_OF"))
        .or_else(|| span.references.first())
        .map(|r| r.span_id.clone());

    RawSpan {
        span_id: span.span_id,
        parent_span_id: parent,
        trace_id: span.trace_id,
        name: span.operation_name,
        start_time_unix_nano: span.start_time.and_then(|us| us.checked_mul(1_000)),
        end_time_unix_nano: None,
        duration_nano: span.duration.and_then(|us| us.checked_mul(1_000)),
        status: None,
        attributes,
    }
}

fn tags_to_map(tags: &[JaegerTag]) -> AttributeMap {
    tags.iter()
        .map(|t| (t.key.clone(), t.value.clone()))
        .collect()
}
