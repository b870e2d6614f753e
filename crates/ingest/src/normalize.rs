use chrono::{DateTime, Utc};
use flowscope_core::ids::{SpanId, TraceId};
use flowscope_core::model::raw::{AttributeMap, RawSpan, RawTrace};
use flowscope_core::model::span::{DeploymentIdentity, Span, SpanStatus, UNKNOWN};
use flowscope_core::time::nanos_to_dt;
use serde_json::Value;
use tracing::warn;

const SERVICE_KEYS: &[&str] = &["service.name", "service"];
const NAMESPACE_KEYS: &[&str] = &["k8s.namespace.name", "namespace", "service.namespace"];
const POD_KEYS: &[&str] = &["k8s.pod.name", "pod.name", "pod", "host.name", "hostname"];
const VERSION_KEYS: &[&str] = &[
    "service.version",
    "k8s.deployment.version",
    "deployment.version",
    "version",
];
const ENVIRONMENT_KEYS: &[&str] = &[
    "deployment.environment.name",
    "deployment.environment",
    "environment",
    "env",
];
const STATUS_KEYS: &[&str] = &["otel.status_code", "status.code"];
const FALLBACK_OPERATION_KEY: &str = "ui.operation";

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Attribute naming the business operation that initiated a trace.
    pub operation_attribute: String,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            operation_attribute: "business.operation".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTrace {
    pub trace_id: String,
    pub spans: Vec<Span>,
    pub dropped: usize,
}

/// Canonicalizes one raw trace. Spans that cannot be placed in time or in
/// the trace are dropped with a warning; the rest always come through.
pub fn normalize_trace(raw: &RawTrace, cfg: &NormalizeConfig) -> NormalizedTrace {
    let trace_id = raw
        .trace_id
        .as_deref()
        .and_then(TraceId::normalize)
        .or_else(|| {
            raw.spans
                .iter()
                .find_map(|s| s.trace_id.as_deref().and_then(TraceId::normalize))
        })
        .map(TraceId::into_string)
        .unwrap_or_default();

    let mut spans = Vec::with_capacity(raw.spans.len());
    let mut dropped = 0;
    for raw_span in &raw.spans {
        match normalize_span(&trace_id, raw_span, cfg) {
            Ok(span) => spans.push(span),
            Err(reason) => {
                dropped += 1;
                warn!(
                    trace_id = %trace_id,
                    span_id = raw_span.span_id.as_deref().unwrap_or("-"),
                    reason,
                    "dropping malformed span"
                );
            }
        }
    }

    NormalizedTrace {
        trace_id,
        spans,
        dropped,
    }
}

fn normalize_span(
    trace_id: &str,
    raw: &RawSpan,
    cfg: &NormalizeConfig,
) -> Result<Span, &'static str> {
    if trace_id.is_empty() {
        return Err("missing trace id");
    }
    let span_id = raw
        .span_id
        .as_deref()
        .and_then(SpanId::normalize)
        .ok_or("missing span id")?
        .into_string();
    if let Some(own) = raw.trace_id.as_deref().and_then(TraceId::normalize)
        && own.as_str() != trace_id
    {
        return Err("span belongs to a different trace");
    }

    let start_ts = timestamp(raw.start_time_unix_nano).ok_or("missing start timestamp")?;
    let end_ts = match raw.end_time_unix_nano {
        Some(end) => timestamp(Some(end)),
        None => raw
            .duration_nano
            .and_then(|d| raw.start_time_unix_nano?.checked_add(d))
            .and_then(|end| timestamp(Some(end))),
    }
    .ok_or("missing end timestamp")?;
    if end_ts < start_ts {
        return Err("end before start");
    }

    let attrs = &raw.attributes;
    let identity = DeploymentIdentity {
        service_name: lookup_or_unknown(attrs, SERVICE_KEYS),
        namespace: lookup_or_unknown(attrs, NAMESPACE_KEYS),
        pod_name: lookup_or_unknown(attrs, POD_KEYS),
        deployment_version: lookup_or_unknown(attrs, VERSION_KEYS),
    };

    Ok(Span {
        trace_id: trace_id.to_string(),
        span_id,
        parent_span_id: raw
            .parent_span_id
            .as_deref()
            .and_then(SpanId::normalize)
            .map(SpanId::into_string),
        operation_name: raw
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN)
            .to_string(),
        start_ts,
        end_ts,
        status: resolve_status(raw),
        identity,
        business_operation: lookup(attrs, &[cfg.operation_attribute.as_str()])
            .or_else(|| lookup(attrs, &[FALLBACK_OPERATION_KEY])),
        environment: lookup(attrs, ENVIRONMENT_KEYS),
    })
}

/// Zero means "not set" in OTLP.
fn timestamp(nanos: Option<u64>) -> Option<DateTime<Utc>> {
    nanos.filter(|n| *n > 0).and_then(nanos_to_dt)
}

/// First non-empty scalar among `keys`.
fn lookup(attrs: &AttributeMap, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match attrs.get(*key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lookup_or_unknown(attrs: &AttributeMap, keys: &[&str]) -> String {
    lookup(attrs, keys).unwrap_or_else(|| UNKNOWN.to_string())
}

fn resolve_status(raw: &RawSpan) -> SpanStatus {
    let declared = raw
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| lookup(&raw.attributes, STATUS_KEYS));
    if let Some(code) = declared {
        return SpanStatus::from_code(&code).unwrap_or_default();
    }
    match lookup(&raw.attributes, &["error"]) {
        Some(flag) if flag.eq_ignore_ascii_case("true") => SpanStatus::Error,
        _ => SpanStatus::Unset,
    }
}
