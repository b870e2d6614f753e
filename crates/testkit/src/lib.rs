use chrono::{DateTime, Duration, TimeZone, Utc};
use flowscope_core::model::flow::{
    EdgeMetrics, FlowEdge, FlowGraph, FlowNode, NodeKey, NodeMetrics,
};
use flowscope_core::model::raw::{RawSpan, RawTrace};
use flowscope_core::model::span::SpanStatus;
use flowscope_core::stats::{LatencySummary, ratio};
use flowscope_core::time::dt_to_nanos;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
}

/// Raw span carrying k8s identity attributes, timed relative to
/// [`base_time`].
pub fn raw_span(
    span_id: &str,
    parent: Option<&str>,
    service: &str,
    namespace: &str,
    start_ms: i64,
    duration_ms: i64,
) -> RawSpan {
    let start = base_time() + Duration::milliseconds(start_ms);
    let end = start + Duration::milliseconds(duration_ms);
    RawSpan {
        span_id: Some(span_id.to_string()),
        parent_span_id: parent.map(str::to_string),
        trace_id: None,
        name: Some(format!("{service} handler")),
        start_time_unix_nano: Some(dt_to_nanos(start)),
        end_time_unix_nano: Some(dt_to_nanos(end)),
        duration_nano: None,
        status: None,
        attributes: Default::default(),
    }
    .attr("service.name", service)
    .attr("k8s.namespace.name", namespace)
    .attr("k8s.pod.name", format!("{service}-0"))
    .attr("service.version", "1.0.0")
}

/// gateway (ns-a) calls auth (ns-b), which does nested work under the same
/// identity.
pub fn gateway_auth_trace(trace_id: &str) -> RawTrace {
    RawTrace {
        trace_id: Some(trace_id.to_string()),
        spans: vec![
            raw_span("a1", None, "gateway", "ns-a", 0, 120)
                .attr("business.operation", "login")
                .attr("deployment.environment", "staging"),
            raw_span("b1", Some("a1"), "auth", "ns-b", 10, 80),
            raw_span("b2", Some("b1"), "auth", "ns-b", 20, 40),
        ],
    }
}

/// Gateway fanning out to two backends, one of which fails.
pub fn checkout_trace(trace_id: &str) -> RawTrace {
    RawTrace {
        trace_id: Some(trace_id.to_string()),
        spans: vec![
            raw_span("c1", None, "gateway", "ns-a", 0, 300).attr("business.operation", "checkout"),
            raw_span("c2", Some("c1"), "cart", "ns-shop", 10, 100),
            raw_span("c3", Some("c1"), "payments", "ns-pay", 120, 150)
                .attr("otel.status_code", "ERROR"),
            raw_span("c4", Some("c3"), "ledger", "ns-pay", 130, 60),
        ],
    }
}

/// Prebuilt flow whose nodes form a chain `hops[0] -> hops[1] -> ...`, each
/// hop a `(service, namespace)` pair on pod `{service}-0`. Hop `i` takes
/// `(hops.len() - i) * 10ms`.
pub fn sample_flow(
    flow_id: &str,
    operation: &str,
    start_offset_secs: i64,
    hops: &[(&str, &str)],
) -> FlowGraph {
    let start = base_time() + Duration::seconds(start_offset_secs);
    let keys = hops
        .iter()
        .map(|(service, namespace)| NodeKey {
            service_name: service.to_string(),
            namespace: namespace.to_string(),
            pod_name: format!("{service}-0"),
        })
        .collect::<Vec<_>>();
    let latency = |i: usize| ((hops.len() - i) as u64) * 10_000_000;

    let mut nodes = keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let mut samples = vec![latency(i)];
            let summary = LatencySummary::from_samples(&mut samples);
            FlowNode {
                id: key.id(),
                service_name: key.service_name.clone(),
                namespace: key.namespace.clone(),
                pod_name: key.pod_name.clone(),
                deployment_version: "1.0.0".to_string(),
                metrics: NodeMetrics {
                    request_count: 1,
                    error_count: 0,
                    total_latency_ns: latency(i),
                    p50_ns: summary.p50_ns,
                    p95_ns: summary.p95_ns,
                    p99_ns: summary.p99_ns,
                    max_ns: summary.max_ns,
                },
                latencies_ns: samples,
            }
        })
        .collect::<Vec<_>>();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let mut edges = keys
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let value = latency(i + 1);
            FlowEdge {
                from: pair[0].id(),
                to: pair[1].id(),
                metrics: EdgeMetrics {
                    call_count: 1,
                    error_count: 0,
                    error_rate: ratio(0, 1),
                    avg_latency_ns: value as f64,
                    p50_ns: value,
                    p95_ns: value,
                    p99_ns: value,
                    max_ns: value,
                },
                latencies_ns: vec![value],
            }
        })
        .collect::<Vec<_>>();
    edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

    let duration_ns = latency(0);
    FlowGraph {
        flow_id: flow_id.to_string(),
        trace_id: flow_id.to_string(),
        operation_name: operation.to_string(),
        environment: None,
        root_node: keys.first().map(NodeKey::id).unwrap_or_default(),
        start_time: start,
        end_time: start + Duration::nanoseconds(duration_ns as i64),
        duration_ns,
        status: SpanStatus::Ok,
        span_count: hops.len(),
        dropped_spans: 0,
        nodes,
        edges,
    }
}

/// [`sample_flow`] tagged with a deployment environment.
pub fn sample_flow_in(
    environment: &str,
    flow_id: &str,
    operation: &str,
    start_offset_secs: i64,
    hops: &[(&str, &str)],
) -> FlowGraph {
    FlowGraph {
        environment: Some(environment.to_string()),
        ..sample_flow(flow_id, operation, start_offset_secs, hops)
    }
}
