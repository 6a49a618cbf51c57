use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    // Composite value: <refresh-token>|<project-id>|<managed-project-id>
    OauthRefresh { value: String },
    ApiKey { value: String },
    // Token is read from the local database at the platform path.
    LocalDb,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Ultra,
    #[default]
    Unknown,
}

impl SubscriptionTier {
    // Label parsing: tokens containing "ultra" win, exact "standard-tier" is
    // Pro, then pro/premium, then free-tier or anything containing "free".
    pub fn from_label(label: &str) -> Self {
        let lowered = label.trim().to_ascii_lowercase();
        if lowered.contains("ultra") {
            SubscriptionTier::Ultra
        } else if lowered == "standard-tier" {
            SubscriptionTier::Pro
        } else if lowered.contains("pro") || lowered.contains("premium") {
            SubscriptionTier::Pro
        } else if lowered == "free-tier" || lowered.contains("free") {
            SubscriptionTier::Free
        } else {
            SubscriptionTier::Unknown
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaSnapshot {
    // Remaining fraction in [0, 1].
    pub fraction_remaining: f64,
    // Absolute reset instant, epoch seconds.
    pub reset_at: i64,
    // When this snapshot was taken; older than 5 minutes counts as unknown.
    pub checked_at: i64,
}

impl QuotaSnapshot {
    pub const STALE_AFTER_SECS: i64 = 300;

    pub fn is_stale(&self, now: i64) -> bool {
        now - self.checked_at > Self::STALE_AFTER_SECS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RateLimitEntry {
    pub limited: bool,
    // Absolute reset instant, epoch milliseconds (never a relative delay).
    pub reset_at_ms: i64,
}

impl RateLimitEntry {
    pub fn expired(&self, now_ms: i64) -> bool {
        !self.limited || self.reset_at_ms <= now_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub credential: Credential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_project_id: Option<String>,
    #[serde(default)]
    pub tier: SubscriptionTier,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_quotas: HashMap<String, QuotaSnapshot>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rate_limits: HashMap<String, RateLimitEntry>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub last_used_ms: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_quota_thresholds: HashMap<String, f64>,
    pub created_at: i64,
}

fn default_enabled() -> bool {
    true
}

impl Account {
    pub fn new(email: String, credential: Credential) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            email,
            credential,
            managed_project_id: None,
            tier: SubscriptionTier::Unknown,
            model_quotas: HashMap::new(),
            rate_limits: HashMap::new(),
            enabled: true,
            invalid: false,
            invalid_reason: None,
            last_used_ms: now * 1000,
            consecutive_failures: 0,
            quota_threshold: None,
            model_quota_thresholds: HashMap::new(),
            created_at: now,
        }
    }

    pub fn update_last_used(&mut self) {
        self.last_used_ms = chrono::Utc::now().timestamp_millis();
    }

    // An invalid or disabled account is never eligible, regardless of model.
    pub fn is_selectable(&self) -> bool {
        self.enabled && !self.invalid
    }

    pub fn is_rate_limited_for(&self, model: &str, now_ms: i64) -> bool {
        self.rate_limits
            .get(model)
            .map(|e| !e.expired(now_ms))
            .unwrap_or(false)
    }

    // Minimum fraction remaining across all known fresh snapshots.
    pub fn min_quota_fraction(&self, now: i64) -> Option<f64> {
        self.model_quotas
            .values()
            .filter(|q| !q.is_stale(now))
            .map(|q| q.fraction_remaining)
            .fold(None, |acc, f| match acc {
                None => Some(f),
                Some(prev) => Some(prev.min(f)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_label_parsing() {
        assert_eq!(
            SubscriptionTier::from_label("ultra-tier"),
            SubscriptionTier::Ultra
        );
        assert_eq!(
            SubscriptionTier::from_label("standard-tier"),
            SubscriptionTier::Pro
        );
        assert_eq!(
            SubscriptionTier::from_label("g1-premium"),
            SubscriptionTier::Pro
        );
        assert_eq!(
            SubscriptionTier::from_label("free-tier"),
            SubscriptionTier::Free
        );
        assert_eq!(
            SubscriptionTier::from_label("legacy-free-plan"),
            SubscriptionTier::Free
        );
        assert_eq!(
            SubscriptionTier::from_label("mystery"),
            SubscriptionTier::Unknown
        );
    }

    #[test]
    fn rate_limit_entry_expiry_uses_absolute_instant() {
        let entry = RateLimitEntry {
            limited: true,
            reset_at_ms: 10_000,
        };
        assert!(!entry.expired(9_999));
        assert!(entry.expired(10_000));
    }

    #[test]
    fn min_quota_ignores_stale_snapshots() {
        let mut account = Account::new(
            "a@test".to_string(),
            Credential::OauthRefresh {
                value: "r".to_string(),
            },
        );
        let now = chrono::Utc::now().timestamp();
        account.model_quotas.insert(
            "fresh-model".to_string(),
            QuotaSnapshot {
                fraction_remaining: 0.4,
                reset_at: now + 3600,
                checked_at: now,
            },
        );
        account.model_quotas.insert(
            "stale-model".to_string(),
            QuotaSnapshot {
                fraction_remaining: 0.1,
                reset_at: now + 3600,
                checked_at: now - 600,
            },
        );
        assert_eq!(account.min_quota_fraction(now), Some(0.4));
    }

    #[test]
    fn serde_defaults_tolerate_sparse_json() {
        let json = r#"{
            "email": "sparse@test",
            "credential": { "kind": "oauth_refresh", "value": "tok|proj" },
            "created_at": 1700000000
        }"#;
        let account: Account = serde_json::from_str(json).expect("sparse account");
        assert!(account.enabled);
        assert!(!account.invalid);
        assert_eq!(account.tier, SubscriptionTier::Unknown);
        assert!(account.rate_limits.is_empty());
    }
}
