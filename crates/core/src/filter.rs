use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowscopeError, Result};
use crate::model::flow::FlowGraph;
use crate::model::span::SpanStatus;
use crate::time::parse_time_or_relative_at;

/// Half-open `[start, end)` range over flow start times.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        if let Some(start) = self.start
            && ts < start
        {
            return false;
        }
        if let Some(end) = self.end
            && ts >= end
        {
            return false;
        }
        true
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end)
            && start > end
        {
            return Err(FlowscopeError::InvalidArgument(format!(
                "inverted time range: start {} is after end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(())
    }
}

/// Composable flow filter. Every populated field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowFilter {
    pub operation: Option<String>,
    /// Matches when any node of the flow runs in this namespace, not only
    /// the initiating one.
    pub namespace: Option<String>,
    pub environment: Option<String>,
    pub status: Option<SpanStatus>,
    pub time_range: TimeRange,
}

impl FlowFilter {
    pub fn matches(&self, flow: &FlowGraph) -> bool {
        if let Some(op) = &self.operation
            && flow.operation_name != *op
        {
            return false;
        }
        if let Some(ns) = &self.namespace
            && !flow.touches_namespace(ns)
        {
            return false;
        }
        if let Some(env) = &self.environment
            && flow.environment.as_deref() != Some(env.as_str())
        {
            return false;
        }
        if let Some(status) = self.status
            && flow.status != status
        {
            return false;
        }
        self.time_range.contains(flow.start_time)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    #[default]
    Pod,
    Service,
}

impl FromStr for GroupBy {
    type Err = FlowscopeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pod" => Ok(Self::Pod),
            "service" => Ok(Self::Service),
            _ => Err(FlowscopeError::InvalidArgument(format!(
                "groupBy must be pod or service, got {s}"
            ))),
        }
    }
}

/// Reads query-string parameters and remembers which keys were consumed so
/// that leftovers can be rejected as unknown filter keys.
pub struct ParamReader<'a> {
    params: &'a BTreeMap<String, String>,
    consumed: BTreeSet<&'a str>,
    now: DateTime<Utc>,
}

impl<'a> ParamReader<'a> {
    pub fn new(params: &'a BTreeMap<String, String>, now: DateTime<Utc>) -> Self {
        Self {
            params,
            consumed: BTreeSet::new(),
            now,
        }
    }

    /// First non-empty value among `names`. Empty values count as absent.
    pub fn string(&mut self, names: &[&str]) -> Option<String> {
        let params = self.params;
        let mut found = None;
        for (key, value) in params {
            if !names.contains(&key.as_str()) {
                continue;
            }
            self.consumed.insert(key.as_str());
            let value = value.trim();
            if found.is_none() && !value.is_empty() {
                found = Some(value.to_string());
            }
        }
        found
    }

    pub fn time(&mut self, names: &[&str]) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.string(names) else {
            return Ok(None);
        };
        parse_time_or_relative_at(&raw, self.now)
            .map(Some)
            .map_err(|e| match e {
                FlowscopeError::Parse(msg) => {
                    FlowscopeError::InvalidArgument(format!("{}: {msg}", names[0]))
                }
                other => other,
            })
    }

    pub fn usize(&mut self, names: &[&str]) -> Result<Option<usize>> {
        let Some(raw) = self.string(names) else {
            return Ok(None);
        };
        raw.parse::<usize>().map(Some).map_err(|_| {
            FlowscopeError::InvalidArgument(format!(
                "{} must be a non-negative integer, got {raw}",
                names[0]
            ))
        })
    }

    pub fn parse<T>(&mut self, names: &[&str]) -> Result<Option<T>>
    where
        T: FromStr<Err = FlowscopeError>,
    {
        let Some(raw) = self.string(names) else {
            return Ok(None);
        };
        T::from_str(&raw).map(Some).map_err(|e| match e {
            FlowscopeError::Parse(msg) => {
                FlowscopeError::InvalidArgument(format!("{}: {msg}", names[0]))
            }
            other => other,
        })
    }

    pub fn time_range(&mut self) -> Result<TimeRange> {
        let range = TimeRange {
            start: self.time(&["startTime", "start_time"])?,
            end: self.time(&["endTime", "end_time"])?,
        };
        range.validate()?;
        Ok(range)
    }

    pub fn flow_filter(&mut self) -> Result<FlowFilter> {
        Ok(FlowFilter {
            operation: self.string(&["operation"]),
            namespace: self.string(&["namespace"]),
            environment: self.string(&["environment"]),
            status: self.parse::<SpanStatus>(&["status"])?,
            time_range: self.time_range()?,
        })
    }

    pub fn finish(self) -> Result<()> {
        let unknown = self
            .params
            .keys()
            .filter(|k| !self.consumed.contains(k.as_str()))
            .map(String::as_str)
            .collect::<Vec<_>>();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(FlowscopeError::InvalidArgument(format!(
                "unknown filter key(s): {}",
                unknown.join(", ")
            )))
        }
    }
}
