//! Backend-neutral trace payload, as handed over by a trace backend client
//! or posted to the analyze endpoint. Nothing here is validated; the
//! normalizer decides what is usable.

use serde::{Deserialize, Deserializer, Serialize};

pub type AttributeMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawTrace {
    #[serde(default, alias = "traceId", alias = "traceID")]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub spans: Vec<RawSpan>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawSpan {
    #[serde(default, alias = "spanId", alias = "spanID")]
    pub span_id: Option<String>,
    #[serde(default, alias = "parentSpanId", alias = "parentSpanID")]
    pub parent_span_id: Option<String>,
    #[serde(default, alias = "traceId", alias = "traceID")]
    pub trace_id: Option<String>,
    #[serde(default, alias = "operationName")]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "startTimeUnixNano",
        deserialize_with = "lenient_u64"
    )]
    pub start_time_unix_nano: Option<u64>,
    #[serde(default, alias = "endTimeUnixNano", deserialize_with = "lenient_u64")]
    pub end_time_unix_nano: Option<u64>,
    #[serde(default, alias = "durationNano", deserialize_with = "lenient_u64")]
    pub duration_nano: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl RawSpan {
    pub fn attr(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Accepts a JSON number, a decimal string, or null. Anything else is
/// treated as absent rather than failing the whole payload.
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}
