use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flowscope_core::error::{FlowscopeError, Result};
use flowscope_core::filter::FlowFilter;
use flowscope_core::model::flow::FlowGraph;
use flowscope_core::query::{
    FlowListRequest, FlowPage, OperationList, OperationStats, OperationSummary,
    OperationsRequest,
};
use flowscope_core::stats::{LatencySummary, ratio};

use crate::FlowStore;
use crate::db::recency_order;

impl FlowStore {
    /// Flows matching `filter`, most recent start first with flow id as the
    /// tie-break.
    pub fn list(&self, filter: &FlowFilter) -> Vec<Arc<FlowGraph>> {
        let inner = self.read();
        let candidates: Box<dyn Iterator<Item = &String> + '_> =
            if let Some(op) = &filter.operation {
                match inner.by_operation.get(op) {
                    Some(ids) => Box::new(ids.iter()),
                    None => return Vec::new(),
                }
            } else if let Some(ns) = &filter.namespace {
                match inner.by_namespace.get(ns) {
                    Some(ids) => Box::new(ids.iter()),
                    None => return Vec::new(),
                }
            } else {
                Box::new(inner.flows.keys())
            };

        let mut out = candidates
            .filter_map(|id| inner.flows.get(id))
            .filter(|flow| filter.matches(flow))
            .cloned()
            .collect::<Vec<_>>();
        drop(inner);

        out.sort_by(|a, b| recency_order(a, b));
        out
    }

    pub fn list_flows(&self, req: &FlowListRequest) -> FlowPage {
        let matched = self.list(&req.filter);
        let total = matched.len();
        let flows = matched
            .iter()
            .skip(req.offset())
            .take(req.page_size)
            .map(|flow| flow.summary())
            .collect();
        FlowPage {
            flows,
            total,
            page: req.page,
            page_size: req.page_size,
        }
    }

    /// Per-operation roll-ups, busiest first.
    pub fn list_operations(&self, req: &OperationsRequest) -> OperationList {
        let mut grouped: BTreeMap<&str, Vec<&FlowGraph>> = BTreeMap::new();
        let flows = self.list(&req.filter);
        for flow in &flows {
            grouped
                .entry(flow.operation_name.as_str())
                .or_default()
                .push(flow);
        }

        let mut operations = grouped
            .into_iter()
            .map(|(name, flows)| summarize(name, &flows))
            .collect::<Vec<_>>();
        operations.sort_by_key(|op| (Reverse(op.flow_count), op.operation_name.clone()));
        OperationList { operations }
    }

    pub fn operation_stats(&self, name: &str, req: &OperationsRequest) -> Result<OperationStats> {
        let filter = FlowFilter {
            operation: Some(name.to_string()),
            ..req.filter.clone()
        };
        let flows = self.list(&filter);
        let flows = flows.iter().map(Arc::as_ref).collect::<Vec<_>>();
        let (Some(first_seen), Some(last_seen)) = (
            flows.iter().map(|f| f.start_time).min(),
            flows.iter().map(|f| f.start_time).max(),
        ) else {
            return Err(FlowscopeError::NotFound(format!("operation {name}")));
        };

        let mut durations = flows.iter().map(|f| f.duration_ns).collect::<Vec<_>>();
        let latency = LatencySummary::from_samples(&mut durations);

        let mut services = BTreeSet::new();
        let mut namespaces = BTreeSet::new();
        for flow in &flows {
            for node in &flow.nodes {
                services.insert(node.service_name.clone());
                namespaces.insert(node.namespace.clone());
            }
        }

        Ok(OperationStats {
            summary: summarize(name, &flows),
            p50_duration_ns: latency.p50_ns,
            p95_duration_ns: latency.p95_ns,
            p99_duration_ns: latency.p99_ns,
            first_seen,
            last_seen,
            services: services.into_iter().collect(),
            namespaces: namespaces.into_iter().collect(),
        })
    }
}

fn summarize(name: &str, flows: &[&FlowGraph]) -> OperationSummary {
    let flow_count = flows.len();
    let error_count = flows.iter().filter(|f| f.status.is_error()).count();
    let total_ns = flows.iter().map(|f| f.duration_ns as u128).sum::<u128>();
    let avg_duration_ns = if flow_count == 0 {
        0.0
    } else {
        total_ns as f64 / flow_count as f64
    };
    OperationSummary {
        operation_name: name.to_string(),
        flow_count,
        error_count,
        error_rate: ratio(error_count as u64, flow_count as u64),
        avg_duration_ns,
    }
}
