pub mod hybrid;
pub mod round_robin;
pub mod sticky;
pub mod strategy;

use crate::models::{Account, AppConfig, RateLimitEntry};
use crate::modules::persistence::accounts::CredentialStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use hybrid::HybridStrategy;
use round_robin::RoundRobinStrategy;
use sticky::StickyStrategy;
pub use strategy::{Selection, SelectionStrategy, StrategyKind};

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub fetched_at_ms: i64,
}

// Central owner of account state. Strategies see snapshots; the dispatcher
// and resolver go through the methods here and never touch fields directly.
pub struct AccountPool {
    accounts: RwLock<Vec<Account>>,
    strategy: RwLock<Arc<dyn SelectionStrategy>>,
    store: Arc<CredentialStore>,
    pub config: AppConfig,
    token_cache: DashMap<String, CachedToken>,
    project_cache: DashMap<String, String>,
}

fn build_strategy(kind: StrategyKind, config: &AppConfig) -> Arc<dyn SelectionStrategy> {
    match kind {
        StrategyKind::Sticky => Arc::new(StickyStrategy::new()),
        StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy::new()),
        StrategyKind::Hybrid => {
            // The pool-wide quota threshold, when set, overrides the hybrid
            // default critical fraction.
            let mut hybrid = config.hybrid.clone();
            if let Some(threshold) = config.pool.quota_threshold {
                hybrid.critical_quota_fraction = threshold;
            }
            Arc::new(HybridStrategy::new(hybrid))
        }
    }
}

impl AccountPool {
    pub async fn new(store: Arc<CredentialStore>, config: AppConfig) -> Self {
        let accounts = store.list().await;
        let kind = StrategyKind::parse(&config.pool.strategy).unwrap_or(StrategyKind::Hybrid);
        tracing::info!(
            "[Pool] Initialized with {} account(s), strategy: {:?}",
            accounts.len(),
            kind
        );
        Self {
            accounts: RwLock::new(accounts),
            strategy: RwLock::new(build_strategy(kind, &config)),
            store,
            config,
            token_cache: DashMap::new(),
            project_cache: DashMap::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }

    pub async fn get(&self, email: &str) -> Option<Account> {
        self.accounts
            .read()
            .await
            .iter()
            .find(|a| a.email == email)
            .cloned()
    }

    // Swapping is safe at runtime: the write lock serialises the transition
    // and a fresh instance drops all strategy-owned state.
    pub async fn set_strategy(&self, kind: StrategyKind) {
        let mut strategy = self.strategy.write().await;
        *strategy = build_strategy(kind, &self.config);
        tracing::info!("[Pool] Strategy switched to {}", strategy.name());
    }

    pub async fn strategy_name(&self) -> &'static str {
        self.strategy.read().await.name()
    }

    async fn sweep_expired_rate_limits(&self) {
        let now = strategy::now_ms();
        let mut accounts = self.accounts.write().await;
        let mut swept = 0;
        for account in accounts.iter_mut() {
            let before = account.rate_limits.len();
            account.rate_limits.retain(|_, entry| !entry.expired(now));
            swept += before - account.rate_limits.len();
        }
        if swept > 0 {
            tracing::debug!("[Pool] Swept {} expired rate-limit mark(s)", swept);
        }
    }

    pub async fn select_account(&self, model: &str) -> Selection {
        self.sweep_expired_rate_limits().await;
        let snapshot = self.snapshot().await;
        let strategy = self.strategy.read().await.clone();
        strategy.select(&snapshot, model).await
    }

    pub async fn available_accounts(&self, model: &str) -> Vec<Account> {
        let now = strategy::now_ms();
        self.accounts
            .read()
            .await
            .iter()
            .filter(|a| strategy::is_eligible(a, model, now))
            .cloned()
            .collect()
    }

    pub async fn is_all_rate_limited(&self, model: &str) -> bool {
        let now = strategy::now_ms();
        let accounts = self.accounts.read().await;
        let selectable: Vec<_> = accounts.iter().filter(|a| a.is_selectable()).collect();
        !selectable.is_empty()
            && selectable
                .iter()
                .all(|a| a.is_rate_limited_for(model, now))
    }

    pub async fn min_wait_ms(&self, model: &str) -> u64 {
        let accounts = self.accounts.read().await;
        strategy::min_reset_wait_ms(&accounts, model, strategy::now_ms())
    }

    pub async fn mark_rate_limited(&self, email: &str, delay_ms: u64, model: &str) {
        let reset_at_ms = strategy::now_ms() + delay_ms as i64;
        {
            let mut accounts = self.accounts.write().await;
            if let Some(account) = accounts.iter_mut().find(|a| a.email == email) {
                account.rate_limits.insert(
                    model.to_string(),
                    RateLimitEntry {
                        limited: true,
                        reset_at_ms,
                    },
                );
                account.consecutive_failures += 1;
                tracing::info!(
                    "[Pool] {} rate-limited for {} ({}ms, failures: {})",
                    email,
                    model,
                    delay_ms,
                    account.consecutive_failures
                );
            }
        }
        self.strategy.read().await.notify_rate_limit(email, model);
    }

    pub async fn notify_success(&self, email: &str, model: &str) {
        {
            let mut accounts = self.accounts.write().await;
            if let Some(account) = accounts.iter_mut().find(|a| a.email == email) {
                account.rate_limits.remove(model);
                account.consecutive_failures = 0;
                account.update_last_used();
            }
        }
        self.strategy.read().await.notify_success(email, model);
    }

    // Strategy-hook-only variant; the failure counter is advanced by
    // record_failure below.
    pub async fn notify_failure(&self, email: &str, model: &str) {
        self.strategy.read().await.notify_failure(email, model);
    }

    // Returns the account's consecutive-failure count after the increment.
    pub async fn record_failure(&self, email: &str, model: &str) -> u32 {
        let count = {
            let mut accounts = self.accounts.write().await;
            match accounts.iter_mut().find(|a| a.email == email) {
                Some(account) => {
                    account.consecutive_failures += 1;
                    account.consecutive_failures
                }
                None => 0,
            }
        };
        self.strategy.read().await.notify_failure(email, model);
        count
    }

    pub async fn mark_invalid(&self, email: &str, reason: &str) {
        {
            let mut accounts = self.accounts.write().await;
            if let Some(account) = accounts.iter_mut().find(|a| a.email == email) {
                account.invalid = true;
                account.invalid_reason = Some(reason.to_string());
            }
        }
        tracing::warn!("[Pool] Account {} marked invalid: {}", email, reason);
        if let Err(e) = self.store.set_invalid(email, reason).await {
            tracing::error!("[Pool] failed_to_persist_invalid_flag: {}", e);
        }
        self.clear_token_cache(Some(email));
        self.clear_project_cache(Some(email));
    }

    pub async fn update_managed_project(&self, email: &str, managed_project_id: &str) {
        let updated = {
            let mut accounts = self.accounts.write().await;
            match accounts.iter_mut().find(|a| a.email == email) {
                Some(account) => {
                    account.managed_project_id = Some(managed_project_id.to_string());
                    Some(account.clone())
                }
                None => None,
            }
        };
        if let Some(account) = updated {
            if let Err(e) = self.store.upsert(account).await {
                tracing::error!("[Pool] failed_to_persist_managed_project: {}", e);
            }
        }
    }

    pub async fn update_credential_and_tier(
        &self,
        email: &str,
        credential: crate::models::Credential,
        tier: Option<crate::models::SubscriptionTier>,
    ) {
        let updated = {
            let mut accounts = self.accounts.write().await;
            match accounts.iter_mut().find(|a| a.email == email) {
                Some(account) => {
                    account.credential = credential;
                    if let Some(tier) = tier {
                        account.tier = tier;
                    }
                    Some(account.clone())
                }
                None => None,
            }
        };
        if let Some(account) = updated {
            if let Err(e) = self.store.upsert(account).await {
                tracing::error!("[Pool] failed_to_persist_credential: {}", e);
            }
        }
    }

    // Optimistic-retry lever: when the whole pool appears limited at dispatch
    // entry, a reset may simply have elapsed while idle.
    pub async fn reset_all_rate_limits(&self) {
        let mut accounts = self.accounts.write().await;
        let mut cleared = 0;
        for account in accounts.iter_mut() {
            cleared += account.rate_limits.len();
            account.rate_limits.clear();
        }
        tracing::warn!("[Pool] Optimistic reset: cleared {} rate-limit mark(s)", cleared);
    }

    pub fn cached_token(&self, email: &str) -> Option<CachedToken> {
        self.token_cache.get(email).map(|t| t.clone())
    }

    pub fn cache_token(&self, email: &str, token: CachedToken) {
        self.token_cache.insert(email.to_string(), token);
    }

    pub fn cached_project(&self, email: &str) -> Option<String> {
        self.project_cache.get(email).map(|p| p.clone())
    }

    pub fn cache_project(&self, email: &str, project_id: String) {
        self.project_cache.insert(email.to_string(), project_id);
    }

    pub fn clear_token_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.token_cache.remove(email);
            }
            None => self.token_cache.clear(),
        }
    }

    pub fn clear_project_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.project_cache.remove(email);
            }
            None => self.project_cache.clear(),
        }
    }

    pub async fn save_to_disk(&self) -> Result<(), String> {
        let snapshot = self.snapshot().await;
        self.store.replace_all(snapshot).await
    }

    // Re-read the on-disk file, keeping live transient state by key-matching
    // on email.
    pub async fn reload(&self) -> Result<usize, String> {
        let fresh = self.store.reload().await?;
        let mut accounts = self.accounts.write().await;
        let transients: std::collections::HashMap<String, (_, u32, i64)> = accounts
            .iter()
            .map(|a| {
                (
                    a.email.clone(),
                    (a.rate_limits.clone(), a.consecutive_failures, a.last_used_ms),
                )
            })
            .collect();

        let mut merged = fresh;
        for account in merged.iter_mut() {
            if let Some((rate_limits, failures, last_used)) = transients.get(&account.email) {
                account.rate_limits = rate_limits.clone();
                account.consecutive_failures = *failures;
                account.last_used_ms = *last_used;
            }
        }
        let count = merged.len();
        *accounts = merged;
        tracing::info!("[Pool] Reloaded {} account(s) from disk", count);
        Ok(count)
    }
}
