use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowscopeError, Result};
use crate::model::flow::NodeKey;

/// Sentinel for identity fields a span did not carry.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
    #[default]
    Unset,
}

impl SpanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Unset => "unset",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::Error)
    }

    /// Recognizes the spellings different backends use for status codes.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "ok" | "status_code_ok" | "1" => Some(Self::Ok),
            "error" | "status_code_error" | "2" => Some(Self::Error),
            "unset" | "status_code_unset" | "0" => Some(Self::Unset),
            _ => None,
        }
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpanStatus {
    type Err = FlowscopeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "unset" => Ok(Self::Unset),
            _ => Err(FlowscopeError::Parse(format!("unknown status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeploymentIdentity {
    pub service_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub deployment_version: String,
}

impl DeploymentIdentity {
    pub fn unknown() -> Self {
        Self {
            service_name: UNKNOWN.to_string(),
            namespace: UNKNOWN.to_string(),
            pod_name: UNKNOWN.to_string(),
            deployment_version: UNKNOWN.to_string(),
        }
    }

    pub fn node_key(&self) -> NodeKey {
        NodeKey {
            service_name: self.service_name.clone(),
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub status: SpanStatus,
    pub identity: DeploymentIdentity,
    pub business_operation: Option<String>,
    pub environment: Option<String>,
}

impl Span {
    pub fn duration_ns(&self) -> u64 {
        (self.end_ts - self.start_ts)
            .num_nanoseconds()
            .unwrap_or(i64::MAX)
            .max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_from_various_backends() {
        assert_eq!(SpanStatus::from_code("STATUS_CODE_ERROR"), Some(SpanStatus::Error));
        assert_eq!(SpanStatus::from_code("2"), Some(SpanStatus::Error));
        assert_eq!(SpanStatus::from_code("Ok"), Some(SpanStatus::Ok));
        assert_eq!(SpanStatus::from_code("0"), Some(SpanStatus::Unset));
        assert_eq!(SpanStatus::from_code("degraded"), None);
    }

    #[test]
    fn status_parse_is_strict() {
        assert_eq!(SpanStatus::from_str("ERROR").unwrap(), SpanStatus::Error);
        assert!(SpanStatus::from_str("2").is_err());
    }
}
