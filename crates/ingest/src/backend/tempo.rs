use async_trait::async_trait;
use flowscope_core::error::{FlowscopeError, Result};
use flowscope_core::ids::TraceId;
use flowscope_core::model::raw::RawTrace;
use futures::{StreamExt, TryStreamExt, stream};
use opentelemetry_proto::tonic::trace::v1::TracesData;
use prost::Message;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{TraceBackend, TraceQuery, check_status, request_error};
use crate::otlp::traces_data_to_raw;

const FETCH_CONCURRENCY: usize = 8;

/// Grafana Tempo: JSON search, then one protobuf fetch per trace.
pub struct TempoBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    traces: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "traceID")]
    trace_id: String,
}

impl TempoBackend {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn search(&self, query: &TraceQuery) -> Result<Vec<String>> {
        let url = format!("{}/api/search", self.base_url);
        let mut params = vec![
            ("start", query.start.timestamp().to_string()),
            // Tempo's end bound is in whole seconds; round up so `now` is covered.
            ("end", (query.end.timestamp() + 1).to_string()),
            ("limit", query.limit.to_string()),
        ];
        if let Some(service) = &query.service {
            params.push(("tags", format!("service.name={service}")));
        }

        let resp = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        let found: SearchResponse = check_status(&url, resp)
            .await?
            .json()
            .await
            .map_err(|e| FlowscopeError::Backend(format!("decoding {url}: {e}")))?;

        let mut ids = found
            .traces
            .into_iter()
            .map(|hit| hit.trace_id)
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// `None` when Tempo no longer (or not yet) has the trace.
    async fn fetch(&self, trace_id: String) -> Result<Option<RawTrace>> {
        let url = format!("{}/api/traces/{trace_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("accept", "application/protobuf")
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(trace_id = %trace_id, "trace not found in tempo, skipping");
            return Ok(None);
        }
        let body = check_status(&url, resp)
            .await?
            .bytes()
            .await
            .map_err(|e| request_error(&url, e))?;
        let data = TracesData::decode(body)
            .map_err(|e| FlowscopeError::Backend(format!("decoding {url}: {e}")))?;

        let spans = traces_data_to_raw(&data)
            .into_iter()
            .flat_map(|trace| trace.spans)
            .collect::<Vec<_>>();
        let trace_id = TraceId::normalize(&trace_id)
            .map(TraceId::into_string)
            .unwrap_or(trace_id);
        Ok(Some(RawTrace {
            trace_id: Some(trace_id),
            spans,
        }))
    }
}

#[async_trait]
impl TraceBackend for TempoBackend {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn query_traces(&self, query: &TraceQuery) -> Result<Vec<RawTrace>> {
        let ids = self.search(query).await?;
        debug!(traces = ids.len(), "tempo search");

        let mut traces = stream::iter(ids)
            .map(|id| self.fetch(id))
            .buffer_unordered(FETCH_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        traces.sort_by(|a, b| a.trace_id.cmp(&b.trace_id));
        Ok(traces)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::Router;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode as HttpStatus, header};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use chrono::{TimeZone, Utc};
    use opentelemetry_proto::tonic::common::v1::any_value::Value;
    use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
    use serde_json::json;

    use super::*;

    fn encoded_trace(trace: u8) -> Vec<u8> {
        let span = |id: u8, parent: Option<u8>| Span {
            trace_id: vec![trace; 16],
            span_id: vec![id; 8],
            parent_span_id: parent.map(|p| vec![p; 8]).unwrap_or_default(),
            name: "op".into(),
            start_time_unix_nano: 1_769_904_000_000_000_000 + id as u64,
            end_time_unix_nano: 1_769_904_000_100_000_000,
            ..Span::default()
        };
        TracesData {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![KeyValue {
                        key: "service.name".into(),
                        value: Some(AnyValue {
                            value: Some(Value::StringValue("checkout".into())),
                        }),
                    }],
                    dropped_attributes_count: 0,
                    entity_refs: vec![],
                }),
                scope_spans: vec![ScopeSpans {
                    scope: None,
                    spans: vec![span(1, None), span(2, Some(1))],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        }
        .encode_to_vec()
    }

    #[tokio::test]
    async fn searches_then_fetches_protobuf() {
        let router = Router::new()
            .route(
                "/api/search",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    assert_eq!(params.get("tags").map(String::as_str), Some("service.name=checkout"));
                    axum::Json(json!({"traces": [
                        {"traceID": "0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a"},
                        {"traceID": "gone"}
                    ]}))
                }),
            )
            .route(
                "/api/traces/{id}",
                get(|Path(id): Path<String>, headers: HeaderMap| async move {
                    assert_eq!(headers[header::ACCEPT], "application/protobuf");
                    if id == "gone" {
                        return HttpStatus::NOT_FOUND.into_response();
                    }
                    encoded_trace(10).into_response()
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let backend = TempoBackend::new(reqwest::Client::new(), &format!("http://{addr}"));
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let traces = backend
            .query_traces(&TraceQuery {
                start,
                end: start + chrono::Duration::minutes(1),
                service: Some("checkout".to_string()),
                limit: 50,
            })
            .await
            .unwrap();

        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(
            trace.trace_id.as_deref(),
            Some("0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a")
        );
        assert_eq!(trace.spans.len(), 2);
        assert_eq!(trace.spans[1].attributes["service.name"], "checkout");
    }
}
