use crate::models::Account;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

const ACCOUNTS_FILE: &str = "accounts.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoredState {
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    settings: StoreSettings,
    #[serde(default)]
    active_index: usize,
}

// On-disk account registry. The file may be edited externally; all writes go
// through one async mutex and always merge against the in-memory baseline so
// a partial update never erases fields.
pub struct CredentialStore {
    path: PathBuf,
    max_accounts: usize,
    state: Mutex<StoredState>,
}

fn read_state(path: &PathBuf) -> Result<StoredState, String> {
    if !path.exists() {
        return Ok(StoredState::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed_to_read_accounts_file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_accounts_file: {}", e))
}

// Fields the resolver and pool maintain at runtime survive an upsert that
// did not carry them.
fn merge_account(baseline: &Account, mut incoming: Account) -> Account {
    if incoming.managed_project_id.is_none() {
        incoming.managed_project_id = baseline.managed_project_id.clone();
    }
    if incoming.quota_threshold.is_none() {
        incoming.quota_threshold = baseline.quota_threshold;
    }
    if incoming.model_quota_thresholds.is_empty() {
        incoming.model_quota_thresholds = baseline.model_quota_thresholds.clone();
    }
    if incoming.model_quotas.is_empty() {
        incoming.model_quotas = baseline.model_quotas.clone();
    }
    incoming.rate_limits = baseline.rate_limits.clone();
    incoming.consecutive_failures = baseline.consecutive_failures;
    incoming.created_at = baseline.created_at;
    incoming
}

impl CredentialStore {
    pub fn open(max_accounts: usize) -> Result<Self, String> {
        let path = super::data_dir()?.join(ACCOUNTS_FILE);
        Self::open_at(path, max_accounts)
    }

    pub fn open_at(path: PathBuf, max_accounts: usize) -> Result<Self, String> {
        let state = read_state(&path)?;
        Ok(Self {
            path,
            max_accounts,
            state: Mutex::new(state),
        })
    }

    pub async fn list(&self) -> Vec<Account> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn get(&self, email: &str) -> Option<Account> {
        self.state
            .lock()
            .await
            .accounts
            .iter()
            .find(|a| a.email == email)
            .cloned()
    }

    pub async fn settings(&self) -> StoreSettings {
        self.state.lock().await.settings.clone()
    }

    pub async fn upsert(&self, account: Account) -> Result<(), String> {
        let mut state = self.state.lock().await;
        match state.accounts.iter().position(|a| a.email == account.email) {
            Some(idx) => {
                let merged = merge_account(&state.accounts[idx], account);
                state.accounts[idx] = merged;
            }
            None => {
                if state.accounts.len() >= self.max_accounts {
                    return Err(format!(
                        "account_limit_reached: maximum {} accounts",
                        self.max_accounts
                    ));
                }
                state.accounts.push(account);
            }
        }
        self.persist(&state)
    }

    pub async fn remove(&self, email: &str) -> Result<bool, String> {
        let mut state = self.state.lock().await;
        let before = state.accounts.len();
        state.accounts.retain(|a| a.email != email);
        let removed = state.accounts.len() != before;
        if removed {
            if state.active_index >= state.accounts.len() {
                state.active_index = 0;
            }
            self.persist(&state)?;
        }
        Ok(removed)
    }

    pub async fn set_enabled(&self, email: &str, enabled: bool) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.email == email)
            .ok_or_else(|| format!("account_not_found: {}", email))?;
        account.enabled = enabled;
        self.persist(&state)
    }

    pub async fn set_invalid(&self, email: &str, reason: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.email == email)
            .ok_or_else(|| format!("account_not_found: {}", email))?;
        account.invalid = true;
        account.invalid_reason = Some(reason.to_string());
        self.persist(&state)
    }

    pub async fn set_thresholds(
        &self,
        email: &str,
        account_threshold: Option<f64>,
        model_thresholds: Option<HashMap<String, f64>>,
    ) -> Result<(), String> {
        if let Some(t) = account_threshold {
            if !(0.0..1.0).contains(&t) {
                return Err(format!("threshold_out_of_range: {}", t));
            }
        }
        if let Some(map) = &model_thresholds {
            for (model, t) in map {
                if !(0.0..1.0).contains(t) {
                    return Err(format!("threshold_out_of_range for {}: {}", model, t));
                }
            }
        }

        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.email == email)
            .ok_or_else(|| format!("account_not_found: {}", email))?;
        if account_threshold.is_some() {
            account.quota_threshold = account_threshold;
        }
        if let Some(map) = model_thresholds {
            account.model_quota_thresholds = map;
        }
        self.persist(&state)
    }

    // Sync a full pool snapshot back to disk (pool-owned mutation path).
    pub async fn replace_all(&self, accounts: Vec<Account>) -> Result<(), String> {
        let mut state = self.state.lock().await;
        state.accounts = accounts;
        self.persist(&state)
    }

    // Re-read the file (it may have been edited externally) without losing
    // in-memory transient state; accounts are key-matched on email.
    pub async fn reload(&self) -> Result<Vec<Account>, String> {
        let mut state = self.state.lock().await;
        let mut fresh = read_state(&self.path)?;

        let transients: HashMap<String, (HashMap<String, crate::models::RateLimitEntry>, u32)> =
            state
                .accounts
                .iter()
                .map(|a| {
                    (
                        a.email.clone(),
                        (a.rate_limits.clone(), a.consecutive_failures),
                    )
                })
                .collect();
        for account in fresh.accounts.iter_mut() {
            if let Some((rate_limits, failures)) = transients.get(&account.email) {
                account.rate_limits = rate_limits.clone();
                account.consecutive_failures = *failures;
            }
        }

        *state = fresh;
        Ok(state.accounts.clone())
    }

    fn persist(&self, state: &StoredState) -> Result<(), String> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| format!("failed_to_serialize_accounts: {}", e))?;
        super::atomic_write(&self.path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credential, RateLimitEntry};

    fn test_store(dir: &tempfile::TempDir, max: usize) -> CredentialStore {
        CredentialStore::open_at(dir.path().join("accounts.json"), max).expect("store")
    }

    fn mk_account(email: &str) -> Account {
        Account::new(
            email.to_string(),
            Credential::OauthRefresh {
                value: format!("refresh-{}", email),
            },
        )
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 5);

        store.upsert(mk_account("a@test")).await.expect("upsert");
        let loaded = store.get("a@test").await.expect("account present");
        assert_eq!(loaded.email, "a@test");
        assert!(loaded.enabled);
    }

    #[tokio::test]
    async fn insert_respects_max_accounts_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 2);

        store.upsert(mk_account("a@test")).await.unwrap();
        store.upsert(mk_account("b@test")).await.unwrap();
        let err = store.upsert(mk_account("c@test")).await.unwrap_err();
        assert!(err.contains("account_limit_reached"));
        // Updating an existing account is not an insert.
        store.upsert(mk_account("a@test")).await.expect("update ok");
    }

    #[tokio::test]
    async fn upsert_merges_instead_of_erasing() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 5);

        let mut original = mk_account("a@test");
        original.managed_project_id = Some("managed-1".to_string());
        original.quota_threshold = Some(0.2);
        original.consecutive_failures = 2;
        store.upsert(original).await.unwrap();

        // An update that carries none of those fields must not blank them.
        store.upsert(mk_account("a@test")).await.unwrap();
        let merged = store.get("a@test").await.unwrap();
        assert_eq!(merged.managed_project_id.as_deref(), Some("managed-1"));
        assert_eq!(merged.quota_threshold, Some(0.2));
        assert_eq!(merged.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn set_thresholds_validates_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 5);
        store.upsert(mk_account("a@test")).await.unwrap();

        let err = store
            .set_thresholds("a@test", Some(1.5), None)
            .await
            .unwrap_err();
        assert!(err.contains("threshold_out_of_range"));

        store
            .set_thresholds("a@test", Some(0.1), None)
            .await
            .expect("valid threshold");
        assert_eq!(store.get("a@test").await.unwrap().quota_threshold, Some(0.1));
    }

    #[tokio::test]
    async fn reload_preserves_transient_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 5);

        let mut account = mk_account("a@test");
        account.rate_limits.insert(
            "model-x".to_string(),
            RateLimitEntry {
                limited: true,
                reset_at_ms: 99_999_999_999,
            },
        );
        account.consecutive_failures = 3;
        store.upsert(account).await.unwrap();

        // Simulate an external edit that knows nothing of transient fields.
        let external = serde_json::json!({
            "accounts": [{
                "email": "a@test",
                "credential": { "kind": "oauth_refresh", "value": "edited" },
                "created_at": 1700000000
            }],
            "settings": {},
            "active_index": 0
        });
        std::fs::write(
            dir.path().join("accounts.json"),
            serde_json::to_string(&external).unwrap(),
        )
        .unwrap();

        let reloaded = store.reload().await.expect("reload");
        let account = reloaded.iter().find(|a| a.email == "a@test").unwrap();
        assert!(matches!(
            &account.credential,
            Credential::OauthRefresh { value } if value == "edited"
        ));
        assert_eq!(account.consecutive_failures, 3);
        assert!(account.rate_limits.contains_key("model-x"));
    }

    #[tokio::test]
    async fn remove_deletes_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 5);
        store.upsert(mk_account("a@test")).await.unwrap();

        assert!(store.remove("a@test").await.unwrap());
        assert!(!store.remove("a@test").await.unwrap());
        assert!(store.get("a@test").await.is_none());
    }

    #[tokio::test]
    async fn set_invalid_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, 5);
        store.upsert(mk_account("a@test")).await.unwrap();
        store
            .set_invalid("a@test", "invalid_grant")
            .await
            .expect("set invalid");

        let reopened = test_store(&dir, 5);
        let account = reopened.get("a@test").await.unwrap();
        assert!(account.invalid);
        assert_eq!(account.invalid_reason.as_deref(), Some("invalid_grant"));
    }
}
