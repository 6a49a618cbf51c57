use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::proxy::state::AppState;

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "type": "error",
            "error": {
                "type": "authentication_error",
                "message": "Missing or invalid API key"
            }
        })),
    )
        .into_response()
}

// Gate /v1/* behind the configured API key; a bearer token or x-api-key
// header both satisfy it. An empty configured key disables the gate.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let expected = state.config.proxy.api_key.trim();
    if expected.is_empty() || !request.uri().path().starts_with("/v1/") {
        return next.run(request).await;
    }

    let headers = request.headers();
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    if bearer == Some(expected) || api_key == Some(expected) {
        next.run(request).await
    } else {
        unauthorized()
    }
}
