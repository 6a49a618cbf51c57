mod account;
mod config;

pub use account::{Account, Credential, QuotaSnapshot, RateLimitEntry, SubscriptionTier};
pub use config::{AppConfig, DispatchConfig, HybridConfig, PoolConfig, ProxyConfig};
