use crate::models::{Account, Credential};
use crate::proxy::pool::{AccountPool, CachedToken};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const TOKEN_TTL_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRefresh {
    pub refresh_token: String,
    pub project_id: Option<String>,
    pub managed_project_id: Option<String>,
}

// `<refresh-token>|<project-id>|<managed-project-id>`; trailing segments are
// optional and an empty trailing segment is emitted without its separator.
pub fn parse_refresh(value: &str) -> CompositeRefresh {
    let mut parts = value.splitn(3, '|');
    let refresh_token = parts.next().unwrap_or_default().to_string();
    let project_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let managed_project_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    CompositeRefresh {
        refresh_token,
        project_id,
        managed_project_id,
    }
}

pub fn format_refresh(composite: &CompositeRefresh) -> String {
    match (&composite.project_id, &composite.managed_project_id) {
        (_, Some(managed)) => format!(
            "{}|{}|{}",
            composite.refresh_token,
            composite.project_id.as_deref().unwrap_or(""),
            managed
        ),
        (Some(project), None) => format!("{}|{}", composite.refresh_token, project),
        (None, None) => composite.refresh_token.clone(),
    }
}

#[derive(Debug, Clone)]
pub enum ResolveError {
    // Network-level trouble: retryable, the account stays valid.
    Transient(String),
    // The credential itself is bad; the account gets invalidated.
    Permanent(String),
}

impl ResolveError {
    pub fn message(&self) -> &str {
        match self {
            ResolveError::Transient(m) | ResolveError::Permanent(m) => m,
        }
    }
}

fn classify_refresh_error(message: &str) -> ResolveError {
    let lowered = message.to_lowercase();
    if lowered.contains("request failed")
        || lowered.contains("timed out")
        || lowered.contains("connection")
        || lowered.contains("dns")
    {
        ResolveError::Transient(message.to_string())
    } else {
        ResolveError::Permanent(message.to_string())
    }
}

// One refresh in flight per email; concurrent misses coalesce.
static REFRESH_FLIGHTS: once_cell::sync::Lazy<DashMap<String, Arc<Mutex<()>>>> =
    once_cell::sync::Lazy::new(DashMap::new);

pub async fn token_for_account(pool: &AccountPool, account: &Account) -> Result<String, ResolveError> {
    let now = chrono::Utc::now().timestamp_millis();
    if let Some(cached) = pool.cached_token(&account.email) {
        if now - cached.fetched_at_ms <= TOKEN_TTL_MS {
            return Ok(cached.access_token);
        }
    }

    match &account.credential {
        Credential::ApiKey { value } => Ok(value.clone()),
        Credential::LocalDb => crate::modules::persistence::local_db::read_access_token()
            .map_err(ResolveError::Transient),
        Credential::OauthRefresh { value } => {
            let flight = REFRESH_FLIGHTS
                .entry(account.email.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let _guard = flight.lock().await;

            // Another waiter may have refreshed while we queued.
            if let Some(cached) = pool.cached_token(&account.email) {
                if chrono::Utc::now().timestamp_millis() - cached.fetched_at_ms <= TOKEN_TTL_MS {
                    return Ok(cached.access_token);
                }
            }

            let composite = parse_refresh(value);
            match crate::modules::auth::oauth::refresh_access_token(&composite.refresh_token).await
            {
                Ok(response) => {
                    pool.cache_token(
                        &account.email,
                        CachedToken {
                            access_token: response.access_token.clone(),
                            fetched_at_ms: chrono::Utc::now().timestamp_millis(),
                        },
                    );
                    Ok(response.access_token)
                }
                Err(message) => {
                    let error = classify_refresh_error(&message);
                    if let ResolveError::Permanent(reason) = &error {
                        tracing::warn!(
                            "[Resolver] Refresh failed permanently for {}: {}",
                            account.email,
                            reason
                        );
                        pool.mark_invalid(&account.email, reason).await;
                    }
                    Err(error)
                }
            }
        }
    }
}
