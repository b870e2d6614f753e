use std::collections::{BTreeMap, HashMap, HashSet};

use flowscope_core::model::flow::{
    EdgeMetrics, FlowEdge, FlowGraph, FlowNode, NodeKey, NodeMetrics,
};
use flowscope_core::model::span::{Span, SpanStatus, UNKNOWN};
use flowscope_core::stats::{LatencySummary, ratio};
use tracing::warn;

use crate::normalize::NormalizedTrace;

#[derive(Default)]
struct NodeAcc {
    deployment_version: Option<String>,
    request_count: u64,
    error_count: u64,
    total_latency_ns: u64,
    latencies_ns: Vec<u64>,
}

#[derive(Default)]
struct EdgeAcc {
    call_count: u64,
    error_count: u64,
    total_latency_ns: u128,
    latencies_ns: Vec<u64>,
}

/// Folds the spans of one trace into a service-call graph. Returns `None`
/// only when no span survived normalization.
pub fn build_flow(trace: NormalizedTrace) -> Option<FlowGraph> {
    let NormalizedTrace {
        trace_id,
        spans,
        dropped,
    } = trace;

    let mut seen = HashSet::new();
    let mut duplicates = 0;
    let mut spans = spans
        .into_iter()
        .filter(|span| {
            let fresh = seen.insert(span.span_id.clone());
            if !fresh {
                duplicates += 1;
                warn!(trace_id = %trace_id, span_id = %span.span_id, "dropping duplicate span id");
            }
            fresh
        })
        .collect::<Vec<_>>();
    if spans.is_empty() {
        return None;
    }
    // Recording order for every accumulator below.
    spans.sort_by(|a, b| {
        a.start_ts
            .cmp(&b.start_ts)
            .then_with(|| a.span_id.cmp(&b.span_id))
    });

    let index = spans
        .iter()
        .enumerate()
        .map(|(i, s)| (s.span_id.as_str(), i))
        .collect::<HashMap<_, _>>();
    let keys = spans
        .iter()
        .map(|s| s.identity.node_key())
        .collect::<Vec<_>>();

    let mut nodes: BTreeMap<NodeKey, NodeAcc> = BTreeMap::new();
    let mut edges: BTreeMap<(NodeKey, NodeKey), EdgeAcc> = BTreeMap::new();

    for (i, span) in spans.iter().enumerate() {
        let latency = span.duration_ns();
        let node = nodes.entry(keys[i].clone()).or_default();
        node.request_count += 1;
        node.total_latency_ns = node.total_latency_ns.saturating_add(latency);
        node.latencies_ns.push(latency);
        if span.status.is_error() {
            node.error_count += 1;
        }
        if node.deployment_version.is_none() && span.identity.deployment_version != UNKNOWN {
            node.deployment_version = Some(span.identity.deployment_version.clone());
        }

        // Nested spans of the same identity share their hop-entry span's edge
        // and are already accounted for on the node.
        let Some(parent) = span.parent_span_id.as_deref().and_then(|p| index.get(p)) else {
            continue;
        };
        if keys[*parent] == keys[i] {
            continue;
        }
        let edge = edges
            .entry((keys[*parent].clone(), keys[i].clone()))
            .or_default();
        edge.call_count += 1;
        edge.total_latency_ns += latency as u128;
        edge.latencies_ns.push(latency);
        if span.status.is_error() {
            edge.error_count += 1;
        }
    }

    let root = find_root(&spans, &index, &keys);
    let root_span = &spans[root];
    let operation_name = root_span
        .business_operation
        .clone()
        .unwrap_or_else(|| root_span.operation_name.clone());
    let environment = root_span
        .environment
        .clone()
        .or_else(|| spans.iter().find_map(|s| s.environment.clone()));

    let start_time = spans[0].start_ts;
    let end_time = spans
        .iter()
        .map(|s| s.end_ts)
        .max()
        .unwrap_or(start_time);
    let duration_ns = (end_time - start_time)
        .num_nanoseconds()
        .unwrap_or(i64::MAX)
        .max(0) as u64;

    let mut nodes = nodes
        .into_iter()
        .map(|(key, acc)| finish_node(key, acc))
        .collect::<Vec<_>>();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    let mut edges = edges
        .into_iter()
        .map(|((from, to), acc)| finish_edge(&from, &to, acc))
        .collect::<Vec<_>>();
    edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

    Some(FlowGraph {
        flow_id: trace_id.clone(),
        trace_id,
        operation_name,
        environment,
        root_node: keys[root].id(),
        start_time,
        end_time,
        duration_ns,
        status: flow_status(&spans),
        span_count: spans.len(),
        dropped_spans: dropped + duplicates,
        nodes,
        edges,
    })
}

/// For every span, the nearest ancestor whose identity differs from the
/// span's own. Spans on a same-identity chain share the answer, so each
/// chain is walked once. A parent cycle yields `None` for the whole chain.
fn service_predecessors(
    spans: &[Span],
    index: &HashMap<&str, usize>,
    keys: &[NodeKey],
) -> Vec<Option<usize>> {
    let mut memo: Vec<Option<Option<usize>>> = vec![None; spans.len()];
    let mut path = Vec::new();
    let mut on_path = HashSet::new();
    for start in 0..spans.len() {
        if memo[start].is_some() {
            continue;
        }
        path.clear();
        on_path.clear();
        let mut current = start;
        let found = loop {
            if let Some(known) = memo[current] {
                break known;
            }
            path.push(current);
            on_path.insert(current);
            let Some(&parent) = spans[current]
                .parent_span_id
                .as_deref()
                .and_then(|p| index.get(p))
            else {
                break None;
            };
            if keys[parent] != keys[current] {
                break Some(parent);
            }
            if on_path.contains(&parent) {
                break None;
            }
            current = parent;
        };
        for &i in &path {
            memo[i] = Some(found);
        }
    }
    memo.into_iter().map(Option::flatten).collect()
}

/// Among spans without a differing-identity ancestor, prefer true roots,
/// then orphans whose parent is not in the trace. Earliest start wins.
fn find_root(spans: &[Span], index: &HashMap<&str, usize>, keys: &[NodeKey]) -> usize {
    let predecessors = service_predecessors(spans, index, keys);
    (0..spans.len())
        .filter(|&i| predecessors[i].is_none())
        .min_by_key(|&i| {
            let rank = match spans[i].parent_span_id.as_deref() {
                None => 0,
                Some(parent) if !index.contains_key(parent) => 1,
                Some(_) => 2,
            };
            // Spans are sorted by (start, id), so the position breaks ties.
            (rank, i)
        })
        .unwrap_or(0)
}

fn flow_status(spans: &[Span]) -> SpanStatus {
    if spans.iter().any(|s| s.status == SpanStatus::Error) {
        SpanStatus::Error
    } else if spans.iter().any(|s| s.status == SpanStatus::Ok) {
        SpanStatus::Ok
    } else {
        SpanStatus::Unset
    }
}

fn finish_node(key: NodeKey, mut acc: NodeAcc) -> FlowNode {
    let latency = LatencySummary::from_samples(&mut acc.latencies_ns);
    FlowNode {
        id: key.id(),
        service_name: key.service_name,
        namespace: key.namespace,
        pod_name: key.pod_name,
        deployment_version: acc
            .deployment_version
            .unwrap_or_else(|| UNKNOWN.to_string()),
        metrics: NodeMetrics {
            request_count: acc.request_count,
            error_count: acc.error_count,
            total_latency_ns: acc.total_latency_ns,
            p50_ns: latency.p50_ns,
            p95_ns: latency.p95_ns,
            p99_ns: latency.p99_ns,
            max_ns: latency.max_ns,
        },
        latencies_ns: acc.latencies_ns,
    }
}

fn finish_edge(from: &NodeKey, to: &NodeKey, mut acc: EdgeAcc) -> FlowEdge {
    let latency = LatencySummary::from_samples(&mut acc.latencies_ns);
    let avg_latency_ns = if acc.call_count == 0 {
        0.0
    } else {
        acc.total_latency_ns as f64 / acc.call_count as f64
    };
    FlowEdge {
        from: from.id(),
        to: to.id(),
        metrics: EdgeMetrics {
            call_count: acc.call_count,
            error_count: acc.error_count,
            error_rate: ratio(acc.error_count, acc.call_count),
            avg_latency_ns,
            p50_ns: latency.p50_ns,
            p95_ns: latency.p95_ns,
            p99_ns: latency.p99_ns,
            max_ns: latency.max_ns,
        },
        latencies_ns: acc.latencies_ns,
    }
}
