use anyhow::{Context, anyhow, bail};
use flowscope_core::config::Config;
use flowscope_core::model::raw::RawTrace;
use serde::de::DeserializeOwned;

/// Thin HTTP client over the query API of a running `flowscope run`.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(addr: Option<String>) -> anyhow::Result<Self> {
        let addr = match addr.or_else(|| std::env::var("FLOWSCOPE_HTTP_ADDR").ok()) {
            Some(addr) => addr,
            None => Config::default().http_addr,
        };
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };
        let http = reqwest::Client::builder()
            .build()
            .context("build HTTP client")?;
        Ok(Self { http, base_url })
    }

    /// GETs the route built from `segments`. Each segment is percent-encoded
    /// on its own, so ids and operation names may contain `/`.
    pub async fn get<T>(&self, segments: &[&str], params: &[(&str, String)]) -> anyhow::Result<T>
    where
        T: DeserializeOwned,
    {
        let url = self.url(segments)?;
        let resp = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("connect query API {}", self.base_url))?;
        decode(resp).await
    }

    /// Returns the flow and whether the server stored it as new.
    pub async fn analyze<T>(&self, trace: &RawTrace) -> anyhow::Result<(T, bool)>
    where
        T: DeserializeOwned,
    {
        let url = self.url(&["api", "analyze"])?;
        let resp = self
            .http
            .post(url)
            .json(trace)
            .send()
            .await
            .with_context(|| format!("connect query API {}", self.base_url))?;
        let created = resp.status() == reqwest::StatusCode::CREATED;
        Ok((decode(resp).await?, created))
    }

    fn url(&self, segments: &[&str]) -> anyhow::Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("bad query API address {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("query API address {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn decode<T>(resp: reqwest::Response) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    let status = resp.status();
    let body = resp.bytes().await.context("read API response")?;
    if !status.is_success() {
        let message = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
        bail!("{message} (HTTP {})", status.as_u16());
    }
    serde_json::from_slice(&body).context("decode API response")
}

#[cfg(test)]
mod tests {
    use flowscope_core::model::flow::FlowGraph;
    use flowscope_core::query::OperationStats;
    use flowscope_ingest::{Analyzer, NormalizeConfig};
    use flowscope_store::FlowStore;
    use testkit::gateway_auth_trace;

    use super::*;
    use crate::http_api::{ApiState, router};

    async fn serve_api() -> ApiClient {
        let state = ApiState {
            analyzer: Analyzer::new(FlowStore::new(10), NormalizeConfig::default()),
            collector: None,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        ApiClient::new(Some(addr.to_string())).unwrap()
    }

    #[test]
    fn segments_are_encoded_one_by_one() {
        let client = ApiClient::new(Some("http://127.0.0.1:7010/".to_string())).unwrap();
        let url = client.url(&["api", "operations", "POST /login"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:7010/api/operations/POST%20%2Flogin"
        );
    }

    #[tokio::test]
    async fn looks_up_operation_named_after_a_route() {
        let client = serve_api().await;
        let mut trace = gateway_auth_trace("t-route");
        trace.spans[0].attributes.remove("business.operation");
        trace.spans[0].name = Some("POST /login".to_string());

        let (flow, created): (FlowGraph, bool) = client.analyze(&trace).await.unwrap();
        assert!(created);
        assert_eq!(flow.operation_name, "POST /login");

        let stats: OperationStats = client
            .get(&["api", "operations", flow.operation_name.as_str()], &[])
            .await
            .unwrap();
        assert_eq!(stats.summary.flow_count, 1);

        let err = client
            .get::<FlowGraph>(&["api", "flows", "a/b"], &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not found: flow a/b (HTTP 404)");
    }
}
