use std::sync::LazyLock;

pub const V1_INTERNAL_BASE_URL_PROD: &str = "https://cloudcode-pa.googleapis.com/v1internal";
pub const V1_INTERNAL_BASE_URL_DAILY: &str =
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal";

// Fixed fallback order: prod first (new accounts provision better there).
pub const V1_INTERNAL_BASE_URLS: [&str; 2] =
    [V1_INTERNAL_BASE_URL_PROD, V1_INTERNAL_BASE_URL_DAILY];

pub const X_GOOG_API_CLIENT: &str = "gl-node/22.0.0";

// Client-Metadata numeric enums expected by the v1internal surface.
pub const IDE_TYPE: u32 = 9;
pub const PLATFORM: u32 = 6;
pub const PLUGIN_TYPE: u32 = 3;

const FALLBACK_VERSION: &str = env!("CARGO_PKG_VERSION");

fn resolve_client_version() -> String {
    if let Ok(v) = std::env::var("ANTIGRAVITY_VERSION") {
        let trimmed = v.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    FALLBACK_VERSION.to_string()
}

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "antigravity/{} {}/{}",
        resolve_client_version(),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

pub fn client_metadata_json() -> serde_json::Value {
    serde_json::json!({
        "ideType": IDE_TYPE,
        "platform": PLATFORM,
        "pluginType": PLUGIN_TYPE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_has_antigravity_prefix() {
        assert!(USER_AGENT.starts_with("antigravity/"));
        assert!(USER_AGENT.contains(std::env::consts::OS));
    }

    #[test]
    fn endpoint_order_is_prod_first() {
        assert_eq!(V1_INTERNAL_BASE_URLS[0], V1_INTERNAL_BASE_URL_PROD);
        assert_eq!(V1_INTERNAL_BASE_URLS[1], V1_INTERNAL_BASE_URL_DAILY);
    }
}
