use reqwest::Client;
use serde_json::Value;
use tokio::time::Duration;

pub struct UpstreamClient {
    client: Client,
    base_urls: Vec<String>,
}

impl UpstreamClient {
    pub fn new(proxy_url: Option<&str>) -> Self {
        Self::with_base_urls(
            proxy_url,
            crate::constants::V1_INTERNAL_BASE_URLS
                .iter()
                .map(|url| (*url).to_string())
                .collect(),
        )
    }

    pub fn with_base_urls(proxy_url: Option<&str>, base_urls: Vec<String>) -> Self {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(crate::constants::USER_AGENT.as_str());

        if let Some(url) = proxy_url {
            if !url.is_empty() {
                match reqwest::Proxy::all(url) {
                    Ok(proxy) => {
                        builder = builder.proxy(proxy);
                        tracing::info!("UpstreamClient enabled proxy: {}", url);
                    }
                    Err(e) => {
                        tracing::error!("invalid_upstream_proxy_url: {}, error: {}", url, e);
                    }
                }
            }
        }

        Self {
            client: builder.build().unwrap_or_else(|_| Client::new()),
            base_urls,
        }
    }

    pub fn base_urls(&self) -> &[String] {
        &self.base_urls
    }

    pub fn build_url(base_url: &str, method: &str, query_string: Option<&str>) -> String {
        if let Some(qs) = query_string {
            format!("{}:{}?{}", base_url, method, qs)
        } else {
            format!("{}:{}", base_url, method)
        }
    }

    // One POST against one endpoint; the dispatch pipeline owns rotation and
    // retry policy.
    pub async fn post_endpoint(
        &self,
        base_url: &str,
        method: &str,
        query_string: Option<&str>,
        access_token: &str,
        body: &Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = Self::build_url(base_url, method, query_string);
        self.client
            .post(&url)
            .bearer_auth(access_token)
            .header("Content-Type", "application/json")
            .header("X-Goog-Api-Client", crate::constants::X_GOOG_API_CLIENT)
            .header(
                "Client-Metadata",
                crate::constants::client_metadata_json().to_string(),
            )
            .json(body)
            .send()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as AsyncMutex;

    #[test]
    fn build_url_with_and_without_query() {
        let base = "https://cloudcode-pa.googleapis.com/v1internal";
        assert_eq!(
            UpstreamClient::build_url(base, "generateContent", None),
            "https://cloudcode-pa.googleapis.com/v1internal:generateContent"
        );
        assert_eq!(
            UpstreamClient::build_url(base, "streamGenerateContent", Some("alt=sse")),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn default_endpoint_order_is_fixed() {
        let client = UpstreamClient::new(None);
        assert_eq!(client.base_urls().len(), 2);
        assert!(client.base_urls()[0].contains("cloudcode-pa.googleapis.com"));
        assert!(client.base_urls()[1].contains("daily-cloudcode-pa"));
    }

    #[derive(Clone, Default)]
    struct CaptureState {
        headers: Arc<AsyncMutex<Vec<(String, String)>>>,
    }

    async fn capture_handler(
        State(state): State<CaptureState>,
        headers: HeaderMap,
    ) -> Json<serde_json::Value> {
        let mut out = Vec::new();
        for (name, value) in &headers {
            out.push((
                name.as_str().to_string(),
                value.to_str().unwrap_or("<non-utf8>").to_string(),
            ));
        }
        *state.headers.lock().await = out;
        Json(json!({ "ok": true }))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn post_endpoint_sends_required_headers() {
        let state = CaptureState::default();
        let app = Router::new()
            .route("/v1internal:generateContent", post(capture_handler))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let base_url = format!("http://{}/v1internal", addr);
        let client = UpstreamClient::with_base_urls(None, vec![base_url.clone()]);
        let response = client
            .post_endpoint(
                &base_url,
                "generateContent",
                None,
                "test-token",
                &json!({ "contents": [] }),
            )
            .await
            .expect("request");
        assert!(response.status().is_success());
        server.abort();

        let captured = state.headers.lock().await.clone();
        let find = |name: &str| -> Option<String> {
            captured
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };

        assert_eq!(find("authorization"), Some("Bearer test-token".to_string()));
        assert_eq!(find("content-type"), Some("application/json".to_string()));
        assert_eq!(
            find("user-agent"),
            Some(crate::constants::USER_AGENT.to_string())
        );
        assert!(find("x-goog-api-client").is_some());
        let metadata: serde_json::Value =
            serde_json::from_str(&find("client-metadata").expect("client metadata")).unwrap();
        assert!(metadata["ideType"].is_number());
        assert!(metadata["platform"].is_number());
        assert!(metadata["pluginType"].is_number());
    }
}
