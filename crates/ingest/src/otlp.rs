use std::collections::BTreeMap;

use flowscope_core::model::raw::{AttributeMap, RawSpan, RawTrace};
use opentelemetry_proto::tonic::common::v1::any_value::Value as OtlpValue;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use opentelemetry_proto::tonic::trace::v1::{Span as OtlpSpan, TracesData};
use serde_json::Value;

/// Groups every span in `data` by trace id. Resource attributes are merged
/// under the span's own attributes.
pub fn traces_data_to_raw(data: &TracesData) -> Vec<RawTrace> {
    let mut traces: BTreeMap<String, Vec<RawSpan>> = BTreeMap::new();
    for resource_spans in &data.resource_spans {
        let resource = resource_spans.resource.as_ref();
        for scope_spans in &resource_spans.scope_spans {
            for span in &scope_spans.spans {
                let raw = decode_span(resource, span);
                let trace_id = raw.trace_id.clone().unwrap_or_default();
                traces.entry(trace_id).or_default().push(raw);
            }
        }
    }

    traces
        .into_iter()
        .map(|(trace_id, spans)| RawTrace {
            trace_id: (!trace_id.is_empty()).then_some(trace_id),
            spans,
        })
        .collect()
}

pub fn decode_span(resource: Option<&Resource>, span: &OtlpSpan) -> RawSpan {
    let mut attributes = resource
        .map(|r| kv_to_json(&r.attributes))
        .unwrap_or_default();
    attributes.extend(kv_to_json(&span.attributes));
    if let Ok(kind) = SpanKind::try_from(span.kind)
        && kind != SpanKind::Unspecified
    {
        attributes
            .entry("span.kind")
            .or_insert_with(|| Value::String(kind.as_str_name().to_string()));
    }

    RawSpan {
        span_id: bytes_to_hex(&span.span_id),
        parent_span_id: bytes_to_hex(&span.parent_span_id),
        trace_id: bytes_to_hex(&span.trace_id),
        name: Some(span.name.clone()).filter(|n| !n.is_empty()),
        start_time_unix_nano: Some(span.start_time_unix_nano).filter(|n| *n > 0),
        end_time_unix_nano: Some(span.end_time_unix_nano).filter(|n| *n > 0),
        duration_nano: None,
        status: span.status.as_ref().map(|s| s.code.to_string()),
        attributes,
    }
}

fn kv_to_json(attrs: &[KeyValue]) -> AttributeMap {
    attrs
        .iter()
        .map(|kv| (kv.key.clone(), any_value_to_json(kv.value.as_ref())))
        .collect()
}

fn any_value_to_json(value: Option<&AnyValue>) -> Value {
    match value.and_then(|v| v.value.as_ref()) {
        Some(OtlpValue::StringValue(s)) => Value::String(s.clone()),
        Some(OtlpValue::BoolValue(b)) => Value::Bool(*b),
        Some(OtlpValue::IntValue(i)) => Value::from(*i),
        Some(OtlpValue::DoubleValue(d)) => Value::from(*d),
        Some(OtlpValue::BytesValue(b)) => Value::String(String::from_utf8_lossy(b).to_string()),
        Some(OtlpValue::ArrayValue(array)) => Value::Array(
            array
                .values
                .iter()
                .map(|v| any_value_to_json(Some(v)))
                .collect(),
        ),
        Some(OtlpValue::KvlistValue(list)) => Value::Object(kv_to_json(&list.values)),
        None => Value::Null,
    }
}

fn bytes_to_hex(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    Some(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

#[cfg(test)]
mod tests {
    use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Status};

    use super::*;

    fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: Some(AnyValue {
                value: Some(OtlpValue::StringValue(value.into())),
            }),
        }
    }

    fn span(trace: u8, id: u8, parent: Option<u8>) -> OtlpSpan {
        OtlpSpan {
            trace_id: vec![trace; 16],
            span_id: vec![id; 8],
            parent_span_id: parent.map(|p| vec![p; 8]).unwrap_or_default(),
            name: "GET /login".into(),
            kind: SpanKind::Server as i32,
            start_time_unix_nano: 1_700_000_000_000_000_000,
            end_time_unix_nano: 1_700_000_000_050_000_000,
            attributes: vec![kv("k8s.pod.name", "auth-7c9d")],
            status: Some(Status {
                message: String::new(),
                code: StatusCode::Error as i32,
            }),
            ..OtlpSpan::default()
        }
    }

    #[test]
    fn groups_spans_by_trace_and_merges_resource() {
        let data = TracesData {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![kv("service.name", "auth"), kv("k8s.pod.name", "ignored")],
                    dropped_attributes_count: 0,
                    entity_refs: vec![],
                }),
                scope_spans: vec![ScopeSpans {
                    scope: None,
                    spans: vec![span(1, 2, None), span(1, 3, Some(2)), span(9, 4, None)],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        };

        let traces = traces_data_to_raw(&data);
        assert_eq!(traces.len(), 2);
        assert_eq!(
            traces[0].trace_id.as_deref(),
            Some("01010101010101010101010101010101")
        );
        let child = &traces[0].spans[1];
        assert_eq!(child.parent_span_id.as_deref(), Some("0202020202020202"));
        assert_eq!(child.attributes["service.name"], "auth");
        assert_eq!(child.attributes["k8s.pod.name"], "auth-7c9d");
        assert_eq!(child.attributes["span.kind"], "SPAN_KIND_SERVER");
        assert_eq!(child.status.as_deref(), Some("2"));
        assert_eq!(child.end_time_unix_nano, Some(1_700_000_000_050_000_000));
    }
}
