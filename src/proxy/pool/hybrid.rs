use super::strategy::*;
use crate::models::{Account, HybridConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

const WEIGHT_HEALTH: f64 = 2.0;
const WEIGHT_TOKENS: f64 = 5.0;
const WEIGHT_QUOTA: f64 = 3.0;
const WEIGHT_LRU: f64 = 0.1;

const HEALTH_START: f64 = 70.0;
const HEALTH_SUCCESS_REWARD: f64 = 1.0;
const HEALTH_RATE_LIMIT_PENALTY: f64 = 10.0;
const HEALTH_FAILURE_PENALTY: f64 = 20.0;
const HEALTH_RECOVERY_PER_HOUR: f64 = 10.0;

const BUCKET_CAPACITY: f64 = 50.0;
const BUCKET_REFILL_PER_MINUTE: f64 = 6.0;

const EMERGENCY_THROTTLE_MS: u64 = 250;
const LAST_RESORT_THROTTLE_MS: u64 = 500;

// Neutral quota component when no fresh snapshot exists.
const QUOTA_UNKNOWN: f64 = 50.0;

struct AccountState {
    health: f64,
    tokens: f64,
    updated_ms: i64,
}

impl AccountState {
    fn new(now: i64) -> Self {
        Self {
            health: HEALTH_START,
            tokens: BUCKET_CAPACITY,
            updated_ms: now,
        }
    }

    // Lazy catch-up: health recovers linearly with idleness, the bucket
    // refills continuously.
    fn advance(&mut self, now: i64) {
        let elapsed_ms = (now - self.updated_ms).max(0) as f64;
        self.health = (self.health + elapsed_ms / 3_600_000.0 * HEALTH_RECOVERY_PER_HOUR)
            .clamp(0.0, 100.0);
        self.tokens =
            (self.tokens + elapsed_ms / 60_000.0 * BUCKET_REFILL_PER_MINUTE).min(BUCKET_CAPACITY);
        self.updated_ms = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterMode {
    // Health + token bucket + quota.
    Primary,
    // Token-bucket filter relaxed.
    Emergency,
    // Health filter relaxed too; only the quota-critical filter remains.
    LastResort,
}

pub struct HybridStrategy {
    config: HybridConfig,
    states: Mutex<HashMap<String, AccountState>>,
}

impl HybridStrategy {
    pub fn new(config: HybridConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn with_state<R>(&self, email: &str, f: impl FnOnce(&mut AccountState) -> R) -> Option<R> {
        let now = now_ms();
        let mut states = self.states.lock().ok()?;
        let state = states
            .entry(email.to_string())
            .or_insert_with(|| AccountState::new(now));
        state.advance(now);
        Some(f(state))
    }

    fn quota_component(&self, account: &Account, model: &str, now_secs: i64) -> (f64, bool) {
        let model_fraction = account
            .model_quotas
            .get(model)
            .filter(|q| !q.is_stale(now_secs))
            .map(|q| q.fraction_remaining);
        let account_min = account.min_quota_fraction(now_secs);

        let fraction = match (model_fraction, account_min) {
            (Some(m), Some(a)) => Some(m.min(a)),
            (Some(m), None) => Some(m),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        };

        // Per-model threshold wins over the account-level one, which wins
        // over the configured default.
        let critical = account
            .model_quota_thresholds
            .get(model)
            .copied()
            .or(account.quota_threshold)
            .unwrap_or(self.config.critical_quota_fraction);

        match fraction {
            None => (QUOTA_UNKNOWN, false),
            Some(f) => {
                if f < critical {
                    return (0.0, true);
                }
                let mut component = f * 100.0;
                if f < self.config.low_quota_fraction {
                    component /= 2.0;
                }
                (component, false)
            }
        }
    }

    fn score_candidates(
        &self,
        accounts: &[Account],
        model: &str,
        mode: FilterMode,
    ) -> Vec<(String, f64)> {
        let now = now_ms();
        let now_secs = now / 1000;
        let mut scored = Vec::new();

        let mut states = match self.states.lock() {
            Ok(s) => s,
            Err(_) => return scored,
        };

        for account in accounts {
            if !is_eligible(account, model, now) {
                continue;
            }
            let (quota, critical) = self.quota_component(account, model, now_secs);
            if critical {
                continue;
            }

            let state = states
                .entry(account.email.clone())
                .or_insert_with(|| AccountState::new(now));
            state.advance(now);

            if mode == FilterMode::Primary && state.tokens < 1.0 {
                continue;
            }
            if mode != FilterMode::LastResort && state.health < self.config.health_floor {
                continue;
            }

            let idle_minutes = ((now - account.last_used_ms).max(0) as f64) / 60_000.0;
            let score = WEIGHT_HEALTH * state.health
                + WEIGHT_TOKENS * (state.tokens / BUCKET_CAPACITY * 100.0)
                + WEIGHT_QUOTA * quota
                + WEIGHT_LRU * idle_minutes;
            scored.push((account.email.clone(), score));
        }

        scored
    }

    fn consume_token(&self, email: &str) {
        self.with_state(email, |state| {
            state.tokens = (state.tokens - 1.0).max(0.0);
        });
    }

    #[cfg(test)]
    fn set_health(&self, email: &str, health: f64) {
        self.with_state(email, |state| state.health = health);
    }

    #[cfg(test)]
    fn set_tokens(&self, email: &str, tokens: f64) {
        self.with_state(email, |state| state.tokens = tokens);
    }

    #[cfg(test)]
    fn health_of(&self, email: &str) -> f64 {
        self.with_state(email, |state| state.health).unwrap_or(0.0)
    }
}

#[async_trait]
impl SelectionStrategy for HybridStrategy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    async fn select(&self, accounts: &[Account], model: &str) -> Selection {
        let best_of = |mut scored: Vec<(String, f64)>| -> Option<String> {
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.into_iter().next().map(|(email, _)| email)
        };
        let account_by_email = |email: &str| -> Option<Account> {
            accounts.iter().find(|a| a.email == email).cloned()
        };

        if let Some(email) = best_of(self.score_candidates(accounts, model, FilterMode::Primary)) {
            self.consume_token(&email);
            if let Some(account) = account_by_email(&email) {
                return Selection::account(account);
            }
        }

        if let Some(email) = best_of(self.score_candidates(accounts, model, FilterMode::Emergency))
        {
            tracing::warn!("[Hybrid] Emergency mode: token-bucket filter relaxed");
            self.consume_token(&email);
            if let Some(account) = account_by_email(&email) {
                return Selection::throttled(account, EMERGENCY_THROTTLE_MS);
            }
        }

        if let Some(email) = best_of(self.score_candidates(accounts, model, FilterMode::LastResort))
        {
            tracing::warn!("[Hybrid] Last-resort mode: health filter relaxed");
            self.consume_token(&email);
            if let Some(account) = account_by_email(&email) {
                return Selection::throttled(account, LAST_RESORT_THROTTLE_MS);
            }
        }

        let wait = min_reset_wait_ms(accounts, model, now_ms());
        if wait > 0 {
            Selection::wait(wait)
        } else {
            Selection::empty()
        }
    }

    fn notify_success(&self, email: &str, _model: &str) {
        self.with_state(email, |state| {
            state.health = (state.health + HEALTH_SUCCESS_REWARD).clamp(0.0, 100.0);
        });
    }

    fn notify_rate_limit(&self, email: &str, _model: &str) {
        self.with_state(email, |state| {
            state.health = (state.health - HEALTH_RATE_LIMIT_PENALTY).clamp(0.0, 100.0);
        });
    }

    fn notify_failure(&self, email: &str, _model: &str) {
        self.with_state(email, |state| {
            state.health = (state.health - HEALTH_FAILURE_PENALTY).clamp(0.0, 100.0);
        });
    }
}
