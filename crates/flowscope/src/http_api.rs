use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use flowscope_core::error::FlowscopeError;
use flowscope_core::model::flow::FlowGraph;
use flowscope_core::model::raw::RawTrace;
use flowscope_core::query::{
    DependencyGraph, DependencyRequest, FlowListRequest, FlowPage, OperationList, OperationStats,
    OperationsRequest, StatusResponse,
};
use flowscope_ingest::{Analyzer, Collector};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

type Params = BTreeMap<String, String>;

/// Largest trace payload `POST /api/analyze` accepts.
pub const MAX_TRACE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct ApiState {
    pub analyzer: Analyzer,
    /// Absent when the server runs without a trace backend.
    pub collector: Option<Collector>,
}

/// Maps the error taxonomy onto HTTP status codes with a
/// `{"error": .., "status": ..}` body.
#[derive(Debug)]
pub struct ApiError(FlowscopeError);

impl From<FlowscopeError> for ApiError {
    fn from(err: FlowscopeError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            FlowscopeError::InvalidArgument(_) | FlowscopeError::Parse(_) => {
                StatusCode::BAD_REQUEST
            }
            FlowscopeError::NotFound(_) => StatusCode::NOT_FOUND,
            FlowscopeError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        error_response(status, self.0.to_string())
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = json!({"error": message, "status": status.as_u16()});
    (status, Json(body)).into_response()
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/api/flows", get(list_flows))
        .route("/api/flows/{flow_id}", get(get_flow))
        .route("/api/dependencies", get(dependencies))
        .route("/api/operations", get(list_operations))
        .route("/api/operations/{name}", get(operation_stats))
        .route(
            "/api/analyze",
            post(analyze).layer(DefaultBodyLimit::max(MAX_TRACE_BYTES)),
        )
        .route("/api/status", get(status))
        .route("/healthz", get(healthz))
        .fallback(unknown_route)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Serves until `shutdown` flips to true, then drains open connections.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind query HTTP listener {addr}"))?;
    tracing::info!(addr = %addr, "query api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("query HTTP server failed")
}

async fn list_flows(
    State(state): State<ApiState>,
    Query(params): Query<Params>,
) -> ApiResult<Json<FlowPage>> {
    let req = FlowListRequest::from_params(&params, Utc::now())?;
    Ok(Json(state.analyzer.store().list_flows(&req)))
}

async fn get_flow(
    State(state): State<ApiState>,
    Path(flow_id): Path<String>,
) -> ApiResult<Json<FlowGraph>> {
    state
        .analyzer
        .store()
        .get(&flow_id)
        .map(|flow| Json(flow.as_ref().clone()))
        .ok_or_else(|| FlowscopeError::NotFound(format!("flow {flow_id}")).into())
}

async fn dependencies(
    State(state): State<ApiState>,
    Query(params): Query<Params>,
) -> ApiResult<Json<DependencyGraph>> {
    let req = DependencyRequest::from_params(&params, Utc::now())?;
    Ok(Json(state.analyzer.store().dependency_graph(&req)))
}

async fn list_operations(
    State(state): State<ApiState>,
    Query(params): Query<Params>,
) -> ApiResult<Json<OperationList>> {
    let req = OperationsRequest::from_params(&params, Utc::now())?;
    Ok(Json(state.analyzer.store().list_operations(&req)))
}

async fn operation_stats(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<Params>,
) -> ApiResult<Json<OperationStats>> {
    let req = OperationsRequest::from_params(&params, Utc::now())?;
    Ok(Json(state.analyzer.store().operation_stats(&name, &req)?))
}

async fn analyze(
    State(state): State<ApiState>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> ApiResult<Response> {
    let body = match body {
        Ok(body) => body,
        // Oversized or unreadable bodies keep their status but get the JSON error body.
        Err(rejection) => return Ok(error_response(rejection.status(), rejection.body_text())),
    };
    let raw: RawTrace = serde_json::from_slice(&body)
        .map_err(|e| FlowscopeError::InvalidArgument(format!("invalid trace payload: {e}")))?;
    let outcome = state.analyzer.analyze(&raw)?;
    let code = if outcome.inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    tracing::debug!(
        trace_id = %outcome.flow.trace_id,
        inserted = outcome.inserted,
        "trace analyzed"
    );
    Ok((code, Json(outcome.flow.as_ref().clone())).into_response())
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        store: state.analyzer.store().stats(),
        collector: state.collector.as_ref().map(Collector::status),
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn unknown_route(uri: Uri) -> ApiError {
    FlowscopeError::NotFound(format!("route {}", uri.path())).into()
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use flowscope_core::model::raw::RawSpan;
    use flowscope_ingest::NormalizeConfig;
    use flowscope_store::FlowStore;
    use serde_json::Value;
    use testkit::{gateway_auth_trace, sample_flow, sample_flow_in};
    use tower::ServiceExt;

    use super::*;

    fn state() -> ApiState {
        let store = FlowStore::new(100);
        store.put(sample_flow("f1", "login", 10, &[("gateway", "ns-a"), ("auth", "ns-b")]));
        store.put(sample_flow("f2", "search", 20, &[("gateway", "ns-a"), ("search", "ns-c")]));
        store.put(sample_flow("f3", "login", 30, &[("gateway", "ns-a"), ("auth", "ns-b")]));
        ApiState {
            analyzer: Analyzer::new(store, NormalizeConfig::default()),
            collector: None,
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn lists_flows_with_filter_and_paging() {
        let app = router(state());
        let (status, body) = send(&app, get("/api/flows?operation=login&pageSize=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["pageSize"], 1);
        assert_eq!(body["flows"][0]["flowId"], "f3");
        assert_eq!(body["flows"][0]["nodeCount"], 2);
    }

    #[tokio::test]
    async fn unknown_parameter_is_bad_request() {
        let app = router(state());
        let (status, body) = send(&app, get("/api/flows?colour=blue")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("colour"));

        let (status, _) = send(&app, get("/api/flows?startTime=yesterday")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn flow_by_id_or_not_found() {
        let app = router(state());
        let (status, body) = send(&app, get("/api/flows/f1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["operationName"], "login");
        assert_eq!(body["edges"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, get("/api/flows/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
    }

    #[tokio::test]
    async fn analyze_creates_then_returns_existing() {
        let app = router(state());
        let trace = gateway_auth_trace("t-login");

        let (status, body) = send(&app, post_json("/api/analyze", &trace)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["flowId"], "t-login");
        assert_eq!(body["nodes"].as_array().unwrap().len(), 2);

        let (status, again) = send(&app, post_json("/api/analyze", &trace)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again, body);

        let (_, listed) = send(&app, get("/api/flows")).await;
        assert_eq!(listed["total"], 4);
    }

    #[tokio::test]
    async fn analyze_rejects_bad_payloads() {
        let app = router(state());
        let empty = RawTrace {
            trace_id: Some("t-empty".to_string()),
            spans: vec![RawSpan {
                span_id: Some("01".to_string()),
                ..RawSpan::default()
            }],
        };
        let (status, body) = send(&app, post_json("/api/analyze", &empty)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], 422);

        let req = Request::post("/api/analyze")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dependencies_and_operations() {
        let app = router(state());
        let (status, deps) = send(&app, get("/api/dependencies?namespace=ns-b")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deps["flowCount"], 2);
        assert_eq!(deps["edges"].as_array().unwrap().len(), 1);
        assert_eq!(deps["edges"][0]["metrics"]["callCount"], 2);

        let (_, grouped) = send(&app, get("/api/dependencies?groupBy=service")).await;
        assert!(
            grouped["nodes"]
                .as_array()
                .unwrap()
                .iter()
                .all(|n| n["podName"] == "*")
        );

        let (_, ops) = send(&app, get("/api/operations")).await;
        assert_eq!(ops["operations"][0]["operationName"], "login");
        assert_eq!(ops["operations"][0]["flowCount"], 2);

        let (status, stats) = send(&app, get("/api/operations/search")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["flowCount"], 1);

        let (status, _) = send(&app, get("/api/operations/refund")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn environment_filter_on_flows_and_dependencies() {
        let state = state();
        let store = state.analyzer.store();
        store.put(sample_flow_in("prod", "p1", "login", 40, &[("gateway", "ns-a"), ("auth", "ns-b")]));
        store.put(sample_flow_in("staging", "s1", "search", 50, &[("gateway", "ns-a"), ("search", "ns-c")]));
        let app = router(state);

        let (status, body) = send(&app, get("/api/flows?environment=prod")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["flows"][0]["flowId"], "p1");

        let (_, none) = send(&app, get("/api/flows?environment=dev")).await;
        assert_eq!(none["total"], 0);

        let (_, deps) = send(&app, get("/api/dependencies?environment=staging")).await;
        assert_eq!(deps["flowCount"], 1);
        assert_eq!(deps["edges"][0]["to"], "ns-c/search/search-0");
    }

    #[tokio::test]
    async fn operation_names_with_slashes_resolve() {
        let app = router(state());
        let mut trace = gateway_auth_trace("t-post");
        trace.spans[0].attributes.remove("business.operation");
        trace.spans[0].name = Some("POST /login".to_string());
        let (status, flow) = send(&app, post_json("/api/analyze", &trace)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(flow["operationName"], "POST /login");

        let (status, stats) = send(&app, get("/api/operations/POST%20%2Flogin")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["operationName"], "POST /login");
        assert_eq!(stats["flowCount"], 1);
    }

    #[tokio::test]
    async fn unmatched_routes_and_oversized_bodies_use_error_body() {
        let app = router(state());
        let (status, body) = send(&app, get("/api/operations/POST/login")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
        assert!(body["error"].as_str().unwrap().contains("/api/operations/POST/login"));

        let req = Request::post("/api/analyze")
            .header("content-type", "application/json")
            .body(Body::from(vec![b' '; MAX_TRACE_BYTES + 1]))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["status"], 413);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn status_and_health() {
        let app = router(state());
        let (status, body) = send(&app, get("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"]["flowCount"], 3);
        assert_eq!(body["store"]["capacity"], 100);
        assert!(body["collector"].is_null());

        let resp = app.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }
}
