use flowscope_core::model::flow::FlowGraph;
use flowscope_core::query::{
    DependencyGraph, FlowPage, OperationList, OperationStats, StatusResponse,
};
use serde::Serialize;

/// Payloads the CLI prints. Serialized untagged so `--json` emits exactly
/// what the API returned.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ApiResponse {
    Flows(FlowPage),
    Flow(FlowGraph),
    Dependencies(DependencyGraph),
    Operations(OperationList),
    Operation(OperationStats),
    Status(StatusResponse),
}
