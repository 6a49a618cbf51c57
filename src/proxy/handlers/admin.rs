use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::proxy::state::AppState;

pub async fn handle_health(State(state): State<AppState>) -> Response {
    let core = state.core().await;
    let accounts = core.pool.len().await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "accounts": accounts,
            "strategy": core.pool.strategy_name().await,
        })),
    )
        .into_response()
}

pub async fn handle_models(State(state): State<AppState>) -> Response {
    let _ = state.core().await;
    let ids = crate::proxy::validation::ModelValidationCache::global()
        .model_ids()
        .await;
    let data: Vec<_> = ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "type": "model",
                "display_name": id,
            })
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({ "data": data, "has_more": false })),
    )
        .into_response()
}

#[derive(Debug, Deserialize, Default)]
pub struct LimitsQuery {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(rename = "includeHistory", default)]
    pub include_history: bool,
}

fn describe_rate_limits(account: &crate::models::Account, now_ms: i64) -> serde_json::Value {
    let limits: serde_json::Map<String, serde_json::Value> = account
        .rate_limits
        .iter()
        .filter(|(_, entry)| entry.limited && entry.reset_at_ms > now_ms)
        .map(|(model, entry)| {
            (
                model.clone(),
                json!({ "reset_in_secs": (entry.reset_at_ms - now_ms) / 1000 }),
            )
        })
        .collect();
    serde_json::Value::Object(limits)
}

pub async fn handle_account_limits(
    State(state): State<AppState>,
    Query(query): Query<LimitsQuery>,
) -> Response {
    let core = state.core().await;
    let accounts = core.pool.snapshot().await;
    let now_ms = chrono::Utc::now().timestamp_millis();
    let now_secs = now_ms / 1000;

    if query.format.as_deref() == Some("table") {
        let mut table = String::from(
            "EMAIL                                    TIER     ENABLED  INVALID  FAILURES  LIMITED-MODELS\n",
        );
        for account in &accounts {
            let limited = account
                .rate_limits
                .iter()
                .filter(|(_, e)| e.limited && e.reset_at_ms > now_ms)
                .map(|(m, _)| m.as_str())
                .collect::<Vec<_>>()
                .join(",");
            table.push_str(&format!(
                "{:<40} {:<8} {:<8} {:<8} {:<9} {}\n",
                account.email,
                format!("{:?}", account.tier).to_lowercase(),
                account.enabled,
                account.invalid,
                account.consecutive_failures,
                if limited.is_empty() { "-" } else { limited.as_str() }
            ));
        }
        return (StatusCode::OK, table).into_response();
    }

    let entries: Vec<_> = accounts
        .iter()
        .map(|account| {
            let quotas: serde_json::Map<String, serde_json::Value> = account
                .model_quotas
                .iter()
                .map(|(model, quota)| {
                    (
                        model.clone(),
                        json!({
                            "fraction_remaining": quota.fraction_remaining,
                            "reset_at": quota.reset_at,
                            "stale": quota.is_stale(now_secs),
                        }),
                    )
                })
                .collect();
            json!({
                "email": account.email,
                "tier": format!("{:?}", account.tier).to_lowercase(),
                "enabled": account.enabled,
                "invalid": account.invalid,
                "invalid_reason": account.invalid_reason,
                "consecutive_failures": account.consecutive_failures,
                "last_used_ms": account.last_used_ms,
                "quotas": quotas,
                "rate_limits": describe_rate_limits(account, now_ms),
            })
        })
        .collect();

    let mut body = json!({ "accounts": entries });
    if query.include_history {
        body["history"] =
            serde_json::to_value(crate::modules::stats::usage::UsageRecorder::global().snapshot())
                .unwrap_or(json!({}));
    }
    (StatusCode::OK, Json(body)).into_response()
}

// Force-refresh access tokens for every enabled account; the token cache is
// dropped first so each account takes the full refresh path.
pub async fn handle_refresh_token(State(state): State<AppState>) -> Response {
    let core = state.core().await;
    core.pool.clear_token_cache(None);

    let accounts = core.pool.snapshot().await;
    let mut refreshed = 0usize;
    let mut failed = 0usize;
    let mut failures = Vec::new();

    for account in accounts.iter().filter(|a| a.is_selectable()) {
        match crate::proxy::resolver::token_for_account(&core.pool, account).await {
            Ok(_) => refreshed += 1,
            Err(e) => {
                failed += 1;
                failures.push(json!({
                    "email": account.email,
                    "error": e.message(),
                }));
            }
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "refreshed": refreshed,
            "failed": failed,
            "failures": failures,
        })),
    )
        .into_response()
}
