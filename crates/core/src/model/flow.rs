use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::span::SpanStatus;
use crate::query::FlowSummary;

/// Uniqueness key of a graph node: one workload instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeKey {
    pub service_name: String,
    pub namespace: String,
    pub pod_name: String,
}

impl NodeKey {
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.service_name, self.pod_name)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.service_name, self.pod_name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub total_latency_ns: u64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    pub service_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub deployment_version: String,
    pub metrics: NodeMetrics,
    /// Raw latencies in recording order; kept so that merged views can
    /// recompute percentiles over the union of samples.
    #[serde(skip)]
    pub latencies_ns: Vec<u64>,
}

impl FlowNode {
    pub fn key(&self) -> NodeKey {
        NodeKey {
            service_name: self.service_name.clone(),
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeMetrics {
    pub call_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_latency_ns: f64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
    pub metrics: EdgeMetrics,
    #[serde(skip)]
    pub latencies_ns: Vec<u64>,
}

/// Service-call graph reconstructed from one trace. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    pub flow_id: String,
    pub trace_id: String,
    pub operation_name: String,
    pub environment: Option<String>,
    pub root_node: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ns: u64,
    pub status: SpanStatus,
    pub span_count: usize,
    pub dropped_spans: usize,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    pub fn touches_namespace(&self, namespace: &str) -> bool {
        self.nodes.iter().any(|n| n.namespace == namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.namespace.as_str())
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            flow_id: self.flow_id.clone(),
            operation_name: self.operation_name.clone(),
            environment: self.environment.clone(),
            start_time: self.start_time,
            duration_ns: self.duration_ns,
            status: self.status,
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
            span_count: self.span_count,
        }
    }
}
