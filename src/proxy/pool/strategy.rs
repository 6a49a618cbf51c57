use crate::models::Account;
use async_trait::async_trait;

pub const STICKY_MAX_WAIT_MS: u64 = 120_000;

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub account: Option<Account>,
    // Without an account: sleep this long and ask again. With an account
    // (hybrid emergency/last-resort): a short dispatcher throttle.
    pub wait_ms: Option<u64>,
}

impl Selection {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn account(account: Account) -> Self {
        Self {
            account: Some(account),
            wait_ms: None,
        }
    }

    pub fn wait(wait_ms: u64) -> Self {
        Self {
            account: None,
            wait_ms: Some(wait_ms),
        }
    }

    pub fn throttled(account: Account, wait_ms: u64) -> Self {
        Self {
            account: Some(account),
            wait_ms: Some(wait_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Sticky,
    RoundRobin,
    Hybrid,
}

impl StrategyKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sticky" => Some(StrategyKind::Sticky),
            "round_robin" | "round-robin" => Some(StrategyKind::RoundRobin),
            "hybrid" => Some(StrategyKind::Hybrid),
            _ => None,
        }
    }
}

// Strategies see the pool read-only; all account mutation lives in the pool
// manager. Implementations own only their selection state, which is reset by
// constructing a fresh instance on strategy swap.
#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn select(&self, accounts: &[Account], model: &str) -> Selection;

    fn notify_success(&self, email: &str, model: &str);
    fn notify_rate_limit(&self, email: &str, model: &str);
    fn notify_failure(&self, email: &str, model: &str);
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn is_eligible(account: &Account, model: &str, now_ms: i64) -> bool {
    account.is_selectable() && !account.is_rate_limited_for(model, now_ms)
}

// Minimum positive reset delay across rate-limited accounts, or 0.
pub fn min_reset_wait_ms(accounts: &[Account], model: &str, now_ms: i64) -> u64 {
    accounts
        .iter()
        .filter(|a| a.is_selectable())
        .filter_map(|a| a.rate_limits.get(model))
        .filter(|e| e.limited && e.reset_at_ms > now_ms)
        .map(|e| (e.reset_at_ms - now_ms) as u64)
        .min()
        .unwrap_or(0)
}
