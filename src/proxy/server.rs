use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::proxy::handlers::{admin, messages};
use crate::proxy::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(messages::handle_count_tokens),
        )
        .route("/v1/models", get(admin::handle_models))
        .route("/health", get(admin::handle_health))
        .route("/account-limits", get(admin::handle_account_limits))
        .route("/refresh-token", post(admin::handle_refresh_token))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::proxy::middleware::auth::require_api_key,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), String> {
    let host = state.config.proxy.host.clone();
    let port = state.config.proxy.port;
    let addr = format!("{}:{}", host, port);

    // Warm the core so the first request does not pay initialisation.
    let _ = state.core().await;

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed_to_bind {}: {}", addr, e))?;
    tracing::info!("Proxy listening on http://{}", addr);

    let mut shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| format!("server_error: {}", e))
}
