use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowscopeError, Result};
use crate::filter::{FlowFilter, GroupBy, ParamReader};
use crate::model::flow::{FlowEdge, FlowNode};
use crate::model::span::SpanStatus;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowListRequest {
    pub filter: FlowFilter,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

impl Default for FlowListRequest {
    fn default() -> Self {
        Self {
            filter: FlowFilter::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl FlowListRequest {
    pub fn from_params(params: &BTreeMap<String, String>, now: DateTime<Utc>) -> Result<Self> {
        let mut reader = ParamReader::new(params, now);
        let filter = reader.flow_filter()?;
        let page = reader.usize(&["page"])?.unwrap_or(1);
        let page_size = reader
            .usize(&["pageSize", "page_size"])?
            .unwrap_or(DEFAULT_PAGE_SIZE);
        reader.finish()?;

        if page == 0 {
            return Err(FlowscopeError::InvalidArgument(
                "page starts at 1".to_string(),
            ));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(FlowscopeError::InvalidArgument(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }

        Ok(Self {
            filter,
            page,
            page_size,
        })
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub flow_id: String,
    pub operation_name: String,
    pub environment: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_ns: u64,
    pub status: SpanStatus,
    pub node_count: usize,
    pub edge_count: usize,
    pub span_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowPage {
    pub flows: Vec<FlowSummary>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DependencyRequest {
    pub filter: FlowFilter,
    pub group_by: GroupBy,
}

impl DependencyRequest {
    pub fn from_params(params: &BTreeMap<String, String>, now: DateTime<Utc>) -> Result<Self> {
        let mut reader = ParamReader::new(params, now);
        let filter = reader.flow_filter()?;
        let group_by = reader
            .parse::<GroupBy>(&["groupBy", "group_by"])?
            .unwrap_or_default();
        reader.finish()?;
        Ok(Self { filter, group_by })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyGraph {
    pub flow_count: usize,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationsRequest {
    pub filter: FlowFilter,
}

impl OperationsRequest {
    pub fn from_params(params: &BTreeMap<String, String>, now: DateTime<Utc>) -> Result<Self> {
        let mut reader = ParamReader::new(params, now);
        let filter = FlowFilter {
            operation: None,
            namespace: reader.string(&["namespace"]),
            environment: reader.string(&["environment"]),
            status: None,
            time_range: reader.time_range()?,
        };
        reader.finish()?;
        Ok(Self { filter })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub operation_name: String,
    pub flow_count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub avg_duration_ns: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationList {
    pub operations: Vec<OperationSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    #[serde(flatten)]
    pub summary: OperationSummary,
    pub p50_duration_ns: u64,
    pub p95_duration_ns: u64,
    pub p99_duration_ns: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub services: Vec<String>,
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub flow_count: usize,
    pub capacity: usize,
    pub oldest_start: Option<DateTime<Utc>>,
    pub newest_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CollectorPhase {
    #[default]
    Idle,
    Collecting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStatus {
    pub phase: CollectorPhase,
    pub backend: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub flows_ingested: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub store: StoreStats,
    pub collector: Option<CollectorStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn flow_list_defaults() {
        let req = FlowListRequest::from_params(&BTreeMap::new(), Utc::now()).unwrap();
        assert_eq!(req, FlowListRequest::default());
        assert_eq!(req.offset(), 0);
    }

    #[test]
    fn flow_list_pagination_validation() {
        let now = Utc::now();
        let req =
            FlowListRequest::from_params(&params(&[("page", "3"), ("pageSize", "20")]), now)
                .unwrap();
        assert_eq!(req.offset(), 40);

        assert!(FlowListRequest::from_params(&params(&[("page", "0")]), now).is_err());
        assert!(FlowListRequest::from_params(&params(&[("pageSize", "5000")]), now).is_err());
        assert!(FlowListRequest::from_params(&params(&[("page", "-1")]), now).is_err());
    }

    #[test]
    fn dependency_request_reads_group_by() {
        let req = DependencyRequest::from_params(
            &params(&[("namespace", "ns-b"), ("groupBy", "service")]),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(req.group_by, GroupBy::Service);
        assert_eq!(req.filter.namespace.as_deref(), Some("ns-b"));
    }

    #[test]
    fn operations_request_rejects_operation_key() {
        let err =
            OperationsRequest::from_params(&params(&[("operation", "login")]), Utc::now())
                .unwrap_err();
        assert!(matches!(err, FlowscopeError::InvalidArgument(_)));
    }

    #[test]
    fn flow_summary_serializes_camel_case() {
        let page = FlowPage {
            flows: Vec::new(),
            total: 0,
            page: 1,
            page_size: 50,
        };
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["pageSize"], 50);
    }
}
