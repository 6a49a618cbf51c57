use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_callback_port: Option<u16>,
}

fn default_port() -> u16 {
    8044
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            api_key: String::new(),
            admin_password: None,
            upstream_proxy_url: None,
            oauth_callback_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_accounts")]
    pub max_accounts: usize,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_threshold: Option<f64>,
}

fn default_max_accounts() -> usize {
    20
}

fn default_strategy() -> String {
    "hybrid".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_accounts: default_max_accounts(),
            strategy: default_strategy(),
            quota_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    // Gate for the "first rate limit, retry same endpoint" branch.
    #[serde(default = "default_quick_retry_cooldown_ms")]
    pub quick_retry_cooldown_ms: u64,
    // Applied when the consecutive-failure ceiling is reached.
    #[serde(default = "default_extended_cooldown_ms")]
    pub extended_cooldown_ms: u64,
    #[serde(default = "default_failure_ceiling")]
    pub consecutive_failure_ceiling: u32,
    #[serde(default = "default_switch_account_delay_ms")]
    pub switch_account_delay_ms: u64,
    #[serde(default = "default_max_wait_before_error_ms")]
    pub max_wait_before_error_ms: u64,
    #[serde(default = "default_max_capacity_retries")]
    pub max_capacity_retries: u32,
    #[serde(default = "default_empty_stream_retries")]
    pub empty_stream_retries: u32,
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,
}

fn default_max_retries() -> usize {
    3
}

fn default_quick_retry_cooldown_ms() -> u64 {
    10_000
}

fn default_extended_cooldown_ms() -> u64 {
    60_000
}

fn default_failure_ceiling() -> u32 {
    3
}

fn default_switch_account_delay_ms() -> u64 {
    5_000
}

fn default_max_wait_before_error_ms() -> u64 {
    120_000
}

fn default_max_capacity_retries() -> u32 {
    5
}

fn default_empty_stream_retries() -> u32 {
    3
}

fn default_fallback_enabled() -> bool {
    false
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            quick_retry_cooldown_ms: default_quick_retry_cooldown_ms(),
            extended_cooldown_ms: default_extended_cooldown_ms(),
            consecutive_failure_ceiling: default_failure_ceiling(),
            switch_account_delay_ms: default_switch_account_delay_ms(),
            max_wait_before_error_ms: default_max_wait_before_error_ms(),
            max_capacity_retries: default_max_capacity_retries(),
            empty_stream_retries: default_empty_stream_retries(),
            fallback_enabled: default_fallback_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default = "default_health_floor")]
    pub health_floor: f64,
    #[serde(default = "default_critical_quota")]
    pub critical_quota_fraction: f64,
    #[serde(default = "default_low_quota")]
    pub low_quota_fraction: f64,
}

fn default_health_floor() -> f64 {
    50.0
}

fn default_critical_quota() -> f64 {
    0.05
}

fn default_low_quota() -> f64 {
    0.10
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            health_floor: default_health_floor(),
            critical_quota_fraction: default_critical_quota(),
            low_quota_fraction: default_low_quota(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            pool: PoolConfig::default(),
            dispatch: DispatchConfig::default(),
            hybrid: HybridConfig::default(),
        }
    }

    // Tunables carry validation ranges; a config outside them never reaches
    // the runtime.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.proxy.port == 0 {
            errors.push("proxy.port must be non-zero".to_string());
        }
        if self.pool.max_accounts == 0 || self.pool.max_accounts > 200 {
            errors.push("pool.max_accounts must be in 1..=200".to_string());
        }
        if !matches!(
            self.pool.strategy.as_str(),
            "sticky" | "round_robin" | "hybrid"
        ) {
            errors.push(format!(
                "pool.strategy must be one of sticky/round_robin/hybrid, got '{}'",
                self.pool.strategy
            ));
        }
        if let Some(t) = self.pool.quota_threshold {
            if !(0.0..1.0).contains(&t) {
                errors.push("pool.quota_threshold must be in [0, 1)".to_string());
            }
        }
        if self.dispatch.max_retries == 0 || self.dispatch.max_retries > 20 {
            errors.push("dispatch.max_retries must be in 1..=20".to_string());
        }
        if self.dispatch.quick_retry_cooldown_ms > 300_000 {
            errors.push("dispatch.quick_retry_cooldown_ms must be <= 300000".to_string());
        }
        if self.dispatch.max_wait_before_error_ms < 1_000 {
            errors.push("dispatch.max_wait_before_error_ms must be >= 1000".to_string());
        }
        if self.dispatch.max_capacity_retries > 20 {
            errors.push("dispatch.max_capacity_retries must be <= 20".to_string());
        }
        if !(0.0..=100.0).contains(&self.hybrid.health_floor) {
            errors.push("hybrid.health_floor must be in [0, 100]".to_string());
        }
        if !(0.0..1.0).contains(&self.hybrid.critical_quota_fraction) {
            errors.push("hybrid.critical_quota_fraction must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&self.hybrid.low_quota_fraction) {
            errors.push("hybrid.low_quota_fraction must be in [0, 1)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}
