use std::sync::Arc;

use flowscope_core::error::{FlowscopeError, Result};
use flowscope_core::model::flow::FlowGraph;
use flowscope_core::model::raw::RawTrace;
use flowscope_store::{FlowStore, PutOutcome};
use tracing::debug;

use crate::build::build_flow;
use crate::normalize::{NormalizeConfig, normalize_trace};

#[derive(Debug, Clone)]
pub struct AnalyzeOutcome {
    pub flow: Arc<FlowGraph>,
    /// False when the trace had already been stored; `flow` is then the
    /// stored graph.
    pub inserted: bool,
}

/// Normalize, build, put. Shared by the collector and the analyze endpoint.
#[derive(Clone)]
pub struct Analyzer {
    store: FlowStore,
    normalize: NormalizeConfig,
}

impl Analyzer {
    pub fn new(store: FlowStore, normalize: NormalizeConfig) -> Self {
        Self { store, normalize }
    }

    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    pub fn analyze(&self, raw: &RawTrace) -> Result<AnalyzeOutcome> {
        let normalized = normalize_trace(raw, &self.normalize);
        let trace_id = normalized.trace_id.clone();
        if let Some(existing) = self.store.get(&trace_id) {
            return Ok(AnalyzeOutcome {
                flow: existing,
                inserted: false,
            });
        }

        let dropped = normalized.dropped;
        let flow = build_flow(normalized).ok_or_else(|| {
            FlowscopeError::Unprocessable(format!(
                "trace {} has no valid span ({dropped} dropped)",
                if trace_id.is_empty() { "<unknown>" } else { trace_id.as_str() }
            ))
        })?;

        let flow_id = flow.flow_id.clone();
        let candidate = Arc::new(flow);
        match self.store.put(candidate.as_ref().clone()) {
            PutOutcome::Inserted { evicted } => {
                debug!(
                    trace_id = %flow_id,
                    nodes = candidate.nodes.len(),
                    edges = candidate.edges.len(),
                    evicted = evicted.len(),
                    "flow stored"
                );
                Ok(AnalyzeOutcome {
                    flow: self.store.get(&flow_id).unwrap_or(candidate),
                    inserted: true,
                })
            }
            // Lost a race with a concurrent put of the same trace.
            PutOutcome::Duplicate => Ok(AnalyzeOutcome {
                flow: self.store.get(&flow_id).unwrap_or(candidate),
                inserted: false,
            }),
        }
    }
}
