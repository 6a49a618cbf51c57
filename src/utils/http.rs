use once_cell::sync::Lazy;
use reqwest::{Client, Proxy};

pub static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| create_base_client(15));
pub static SHARED_CLIENT_LONG: Lazy<Client> = Lazy::new(|| create_base_client(60));

fn proxy_url_from_env() -> Option<String> {
    for key in ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"] {
        if let Ok(v) = std::env::var(key) {
            let t = v.trim();
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
    }
    None
}

fn create_base_client(timeout_secs: u64) -> Client {
    let mut builder = Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .user_agent(crate::constants::USER_AGENT.as_str());

    if let Some(url) = proxy_url_from_env() {
        match Proxy::all(&url) {
            Ok(proxy) => {
                builder = builder.proxy(proxy);
                tracing::info!("HTTP shared client enabled proxy: {}", url);
            }
            Err(e) => {
                tracing::error!("invalid_proxy_url: {}, error: {}", url, e);
            }
        }
    }

    builder.build().unwrap_or_else(|_| Client::new())
}

pub fn get_client() -> Client {
    SHARED_CLIENT.clone()
}

pub fn get_long_client() -> Client {
    SHARED_CLIENT_LONG.clone()
}
