pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
#[cfg(test)]
mod test_utils;
pub mod utils;

use modules::system::logger;
use std::sync::Arc;
use tracing::{error, info, warn};

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env_overrides(config: &mut crate::models::AppConfig) {
    if let Ok(key) = std::env::var("API_KEY") {
        if !key.trim().is_empty() {
            info!("Using API key from environment");
            config.proxy.api_key = key;
        }
    }

    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.proxy.port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }

    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.proxy.host = host.trim().to_string();
            info!("Using bind host from environment: {}", config.proxy.host);
        }
    }

    if let Ok(password) = std::env::var("WEBUI_PASSWORD") {
        if !password.trim().is_empty() {
            info!("Using admin password from environment");
            config.proxy.admin_password = Some(password);
        }
    }

    if let Ok(fallback) = std::env::var("FALLBACK") {
        if let Some(parsed) = parse_env_bool(&fallback) {
            config.dispatch.fallback_enabled = parsed;
            info!(
                "Using cross-model fallback setting from environment: {}",
                parsed
            );
        } else {
            warn!(
                "[W-FALLBACK-INVALID] ignoring_invalid_fallback_value: {}",
                fallback
            );
        }
    }

    if let Ok(port) = std::env::var("OAUTH_CALLBACK_PORT") {
        if let Ok(p) = port.trim().parse::<u16>() {
            config.proxy.oauth_callback_port = Some(p);
        }
    }
}

async fn start_runtime(
) -> error::AppResult<(proxy::state::AppState, tokio::sync::watch::Sender<bool>)> {
    let mut config = modules::system::config::load_app_config()
        .map_err(|e| error::AppError::Config(format!("failed_to_load_config: {}", e)))?;
    apply_env_overrides(&mut config);
    config.validate().map_err(|errors| {
        error::AppError::Config(format!(
            "configuration_validation_failed:\n{}",
            errors.join("\n")
        ))
    })?;

    let store = Arc::new(
        modules::persistence::accounts::CredentialStore::open(config.pool.max_accounts)
            .map_err(|e| {
                error::AppError::Account(format!("failed_to_open_account_store: {}", e))
            })?,
    );
    let state = proxy::state::AppState::new(config, store);

    modules::system::scheduler::start_scheduler(state.clone());
    info!("Scheduler started");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = proxy::server::serve(server_state, shutdown_rx).await {
            error!("[E-RUNTIME-SERVER] {}", e);
        }
    });

    Ok((state, shutdown_tx))
}

pub fn run() {
    logger::init_logger();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let (state, shutdown_tx) = match start_runtime().await {
            Ok(parts) => parts,
            Err(e) => {
                error!("[E-RUNTIME-STARTUP] {}", e);
                std::process::exit(1);
            }
        };

        info!("Service is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");

        let _ = shutdown_tx.send(true);
        modules::system::scheduler::stop_scheduler();
        if let Err(e) = modules::stats::usage::UsageRecorder::global().flush_if_dirty() {
            warn!("[W-RUNTIME-STOP] usage_flush_failed: {}", e);
        }
        let core = state.core().await;
        if let Err(e) = core.pool.save_to_disk().await {
            warn!("[W-RUNTIME-STOP] pool_persist_failed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::{apply_env_overrides, parse_env_bool};
    use crate::models::AppConfig;
    use crate::test_utils::ScopedEnvVar;
    use std::sync::{Mutex, OnceLock};

    static LIB_TEST_ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    #[test]
    fn parse_env_bool_variants() {
        assert_eq!(parse_env_bool("true"), Some(true));
        assert_eq!(parse_env_bool("0"), Some(false));
        assert_eq!(parse_env_bool("ON"), Some(true));
        assert_eq!(parse_env_bool("maybe"), None);
    }

    #[test]
    fn env_port_overrides_config_port() {
        let _guard = LIB_TEST_ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("lib env test lock");
        let _port = ScopedEnvVar::set("PORT", "8045");

        let mut config = AppConfig::default();
        config.proxy.port = 8145;
        apply_env_overrides(&mut config);
        assert_eq!(config.proxy.port, 8045);
    }

    #[test]
    fn env_fallback_flag_toggles_cross_model_fallback() {
        let _guard = LIB_TEST_ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("lib env test lock");
        let _fallback = ScopedEnvVar::set("FALLBACK", "true");

        let mut config = AppConfig::default();
        assert!(!config.dispatch.fallback_enabled);
        apply_env_overrides(&mut config);
        assert!(config.dispatch.fallback_enabled);
    }

    #[test]
    fn invalid_env_port_is_ignored() {
        let _guard = LIB_TEST_ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("lib env test lock");
        let _port = ScopedEnvVar::set("PORT", "not-a-port");

        let mut config = AppConfig::default();
        let original = config.proxy.port;
        apply_env_overrides(&mut config);
        assert_eq!(config.proxy.port, original);
    }
}
