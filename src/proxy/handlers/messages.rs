use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::info;

use crate::proxy::dispatch::{DispatchError, DispatchOutput};
use crate::proxy::mappers;
use crate::proxy::state::AppState;

fn error_response(status: StatusCode, error_type: &str, message: String) -> Response {
    (
        status,
        Json(json!({
            "type": "error",
            "error": { "type": error_type, "message": message }
        })),
    )
        .into_response()
}

fn trace_id() -> String {
    rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let trace_id = trace_id();

    let mut request: mappers::models::ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("Invalid request body: {}", e),
            );
        }
    };

    info!(
        "[{}] Claude request | model: {} | stream: {} | messages: {}",
        trace_id,
        request.model,
        request.stream,
        request.messages.len()
    );

    mappers::clean_cache_control(&mut request.messages);
    let target_family = mappers::thinking::model_family(&request.model);
    mappers::thinking::filter_signatures_for_family(&mut request.messages, target_family);
    mappers::thinking::close_tool_loop(&mut request.messages);

    let core = state.core().await;
    match core.dispatcher.dispatch(request, &trace_id).await {
        Ok(success) => match success.output {
            DispatchOutput::Json(message) => (
                StatusCode::OK,
                [
                    ("X-Account-Email", success.email.as_str()),
                    ("X-Served-Model", success.model.as_str()),
                ],
                Json(message),
            )
                .into_response(),
            DispatchOutput::Stream(stream) => {
                let body_stream = stream.map(|result| -> Result<bytes::Bytes, std::io::Error> {
                    match result {
                        Ok(bytes) => Ok(bytes),
                        // Mid-stream failures become a visible error event
                        // rather than a dropped connection.
                        Err(message) => Ok(bytes::Bytes::from(format!(
                            "event: error\ndata: {}\n\n",
                            json!({
                                "type": "error",
                                "error": { "type": "api_error", "message": message }
                            })
                        ))),
                    }
                });
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .header(header::CACHE_CONTROL, "no-cache")
                    .header(header::CONNECTION, "keep-alive")
                    .header("X-Accel-Buffering", "no")
                    .header("X-Account-Email", success.email)
                    .header("X-Served-Model", success.model)
                    .body(Body::from_stream(body_stream))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        },
        Err(DispatchError::InvalidRequest { message }) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request_error", message)
        }
        // Surfaced as 400 rather than 429 so clients do not auto-retry past
        // the reset time.
        Err(DispatchError::ResourceExhausted { model, reset_ms }) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!(
                "All accounts for model '{}' are quota-exhausted; earliest reset in {}s. \
                 Retry after the reset or switch models.",
                model,
                reset_ms / 1000
            ),
        ),
        Err(DispatchError::Fatal { message }) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "api_error", message)
        }
    }
}

pub async fn handle_count_tokens() -> Response {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "api_error",
        "count_tokens is not implemented by this proxy".to_string(),
    )
}
