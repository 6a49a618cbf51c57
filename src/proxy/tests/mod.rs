mod dispatch_scenarios;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub bearer: String,
    pub model: String,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl MockReply {
    pub fn ok_text(text: &str) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::json!({
                "response": {
                    "candidates": [{
                        "content": { "parts": [{ "text": text }] },
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 3 }
                }
            })
            .to_string(),
        }
    }

    pub fn ok_sse_text(text: &str) -> Self {
        let event = serde_json::json!({
            "response": {
                "candidates": [{
                    "content": { "parts": [{ "text": text }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 3 }
            }
        });
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
            body: format!("data: {}\n\n", event),
        }
    }

    pub fn status_body(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub type MockBehavior = Arc<dyn Fn(&MockRequest) -> MockReply + Send + Sync>;

#[derive(Clone)]
struct MockState {
    behavior: MockBehavior,
    log: Arc<AsyncMutex<Vec<MockRequest>>>,
}

async fn mock_handler(
    State(state): State<MockState>,
    Path(call): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let method = call
        .split_once(':')
        .map(|(_, m)| m.to_string())
        .unwrap_or(call);
    let method = method
        .split_once('?')
        .map(|(m, _)| m.to_string())
        .unwrap_or(method);
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let model = parsed
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();

    let request = {
        let mut log = state.log.lock().await;
        let request = MockRequest {
            method,
            bearer,
            model,
            index: log.len(),
        };
        log.push(request.clone());
        request
    };

    let reply = (state.behavior)(&request);
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in &reply.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(reply.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub struct MockUpstream {
    pub base_url: String,
    log: Arc<AsyncMutex<Vec<MockRequest>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(behavior: MockBehavior) -> Self {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let state = MockState {
            behavior,
            log: log.clone(),
        };
        // The upstream URL shape is a single path segment,
        // "v1internal:generateContent", so one param route matches it.
        let app = Router::new()
            .route("/:call", post(mock_handler))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        Self {
            base_url: format!("http://{}/v1internal", addr),
            log,
            handle,
        }
    }

    pub async fn requests(&self) -> Vec<MockRequest> {
        self.log.lock().await.clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
