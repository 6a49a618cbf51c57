use crate::models::{Account, Credential, SubscriptionTier};
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::UpstreamClient;
use serde_json::{json, Value};

const DEFAULT_PROJECT_ID: &str = "default-cloud-code-project";
const ONBOARD_POLL_ATTEMPTS: u32 = 10;
const ONBOARD_POLL_INTERVAL_SECS: u64 = 5;

fn load_code_assist_body() -> Value {
    json!({ "metadata": crate::constants::client_metadata_json() })
}

// `cloudaicompanionProject` arrives either as a bare string or as an object
// carrying an `id`.
fn extract_project(data: &Value) -> Option<String> {
    match data.get("cloudaicompanionProject") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Object(obj)) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn tier_entry_id(entry: &Value) -> Option<String> {
    entry
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// Documented priority: paidTier.id, then currentTier.id, then the default
// entry of allowedTiers. Some upstream paths look authoritative on
// currentTier alone; we keep the documented order.
pub fn extract_tier_id(data: &Value) -> Option<String> {
    if let Some(id) = data.get("paidTier").and_then(tier_entry_id) {
        return Some(id);
    }
    if let Some(id) = data.get("currentTier").and_then(tier_entry_id) {
        return Some(id);
    }
    let allowed = data.get("allowedTiers")?.as_array()?;
    allowed
        .iter()
        .find(|t| {
            t.get("isDefault")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
        .or_else(|| allowed.first())
        .and_then(tier_entry_id)
}

pub fn extract_tier(data: &Value) -> SubscriptionTier {
    extract_tier_id(data)
        .map(|id| SubscriptionTier::from_label(&id))
        .unwrap_or(SubscriptionTier::Unknown)
}

async fn call_v1_internal_auth(
    upstream: &UpstreamClient,
    method: &str,
    access_token: &str,
    body: &Value,
) -> Result<Value, String> {
    let mut last_err = String::new();

    for base_url in upstream.base_urls() {
        let response = upstream
            .post_endpoint(base_url, method, None, access_token, body)
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                return resp
                    .json::<Value>()
                    .await
                    .map_err(|e| format!("{} parse failed: {}", method, e));
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                last_err = format!("{} returned {} at {}: {}", method, status, base_url, text);
                tracing::warn!("[Resolver] {}", last_err);
            }
            Err(e) => {
                last_err = format!("{} request failed at {}: {}", method, base_url, e);
                tracing::debug!("[Resolver] {}", last_err);
            }
        }
    }
    Err(last_err)
}

async fn fetch_tier(upstream: &UpstreamClient, access_token: &str) -> Option<SubscriptionTier> {
    match call_v1_internal_auth(
        upstream,
        "loadCodeAssist",
        access_token,
        &load_code_assist_body(),
    )
    .await
    {
        Ok(data) => Some(extract_tier(&data)),
        Err(e) => {
            tracing::warn!("[Resolver] Tier fetch failed: {}", e);
            None
        }
    }
}

async fn persist_managed_project(pool: &AccountPool, account: &Account, managed_id: &str) {
    if let Credential::OauthRefresh { value } = &account.credential {
        let mut composite = super::token::parse_refresh(value);
        composite.managed_project_id = Some(managed_id.to_string());
        pool.update_credential_and_tier(
            &account.email,
            Credential::OauthRefresh {
                value: super::token::format_refresh(&composite),
            },
            None,
        )
        .await;
    }
    pool.update_managed_project(&account.email, managed_id).await;
}

async fn onboard_user(
    upstream: &UpstreamClient,
    access_token: &str,
    tier_id: &str,
    project_id: Option<&str>,
) -> Option<String> {
    let mut body = json!({
        "tierId": tier_id,
        "metadata": crate::constants::client_metadata_json(),
    });
    if let Some(project) = project_id {
        body["cloudaicompanionProject"] = json!(project);
    }

    for attempt in 1..=ONBOARD_POLL_ATTEMPTS {
        match call_v1_internal_auth(upstream, "onboardUser", access_token, &body).await {
            Ok(data) => {
                let done = data.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
                let discovered = data
                    .get("response")
                    .map(|r| extract_project(r))
                    .unwrap_or(None);
                if let Some(id) = discovered {
                    return Some(id);
                }
                if done {
                    return project_id.map(str::to_string);
                }
            }
            Err(e) => {
                tracing::warn!("[Resolver] onboardUser attempt {} failed: {}", attempt, e);
            }
        }
        if attempt < ONBOARD_POLL_ATTEMPTS {
            tokio::time::sleep(std::time::Duration::from_secs(ONBOARD_POLL_INTERVAL_SECS)).await;
        }
    }
    project_id.map(str::to_string)
}

// Resolve the managed project id for an account, onboarding it if the
// upstream has never seen it. Results are cached per email without TTL; a
// 401 clears the entry.
pub async fn project_for_account(
    pool: &AccountPool,
    upstream: &UpstreamClient,
    account: &Account,
    access_token: &str,
) -> String {
    if let Some(cached) = pool.cached_project(&account.email) {
        return cached;
    }

    let composite = match &account.credential {
        Credential::OauthRefresh { value } => Some(super::token::parse_refresh(value)),
        _ => None,
    };
    let embedded_project = composite.as_ref().and_then(|c| c.project_id.clone());

    if let Some(managed) = composite.as_ref().and_then(|c| c.managed_project_id.clone()) {
        if account.tier == SubscriptionTier::Unknown {
            if let Some(tier) = fetch_tier(upstream, access_token).await {
                pool.update_credential_and_tier(&account.email, account.credential.clone(), Some(tier))
                    .await;
            }
        }
        pool.cache_project(&account.email, managed.clone());
        return managed;
    }

    match call_v1_internal_auth(
        upstream,
        "loadCodeAssist",
        access_token,
        &load_code_assist_body(),
    )
    .await
    {
        Ok(data) => {
            let tier = extract_tier(&data);
            if tier != SubscriptionTier::Unknown && account.tier != tier {
                pool.update_credential_and_tier(&account.email, account.credential.clone(), Some(tier))
                    .await;
            }

            if let Some(project) = extract_project(&data) {
                persist_managed_project(pool, account, &project).await;
                pool.cache_project(&account.email, project.clone());
                return project;
            }

            // Account reports no project yet: onboard it against the
            // discovered tier.
            if let Some(tier_id) = extract_tier_id(&data) {
                tracing::info!(
                    "[Resolver] {} has no managed project; onboarding with tier {}",
                    account.email,
                    tier_id
                );
                if let Some(project) =
                    onboard_user(upstream, access_token, &tier_id, embedded_project.as_deref())
                        .await
                {
                    persist_managed_project(pool, account, &project).await;
                    pool.cache_project(&account.email, project.clone());
                    return project;
                }
            }
        }
        Err(e) => {
            tracing::warn!(
                "[Resolver] loadCodeAssist failed for {}: {}",
                account.email,
                e
            );
        }
    }

    let fallback = embedded_project.unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
    tracing::warn!(
        "[Resolver] Falling back to project id '{}' for {}",
        fallback,
        account.email
    );
    fallback
}
