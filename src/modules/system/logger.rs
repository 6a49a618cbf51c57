use crate::modules::persistence::data_dir;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_RETENTION_DAYS: u64 = 7;

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.to_rfc3339())
    }
}

pub fn get_log_dir() -> Result<PathBuf, String> {
    let log_dir = data_dir()?.join("logs");
    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)
            .map_err(|e| format!("failed_to_create_log_directory: {}", e))?;
    }
    Ok(log_dir)
}

fn debug_enabled() -> bool {
    for key in ["DEBUG", "DEV_MODE"] {
        if let Ok(v) = std::env::var(key) {
            let lowered = v.trim().to_ascii_lowercase();
            if matches!(lowered.as_str(), "1" | "true" | "yes" | "on") {
                return true;
            }
        }
    }
    false
}

pub fn init_logger() {
    let _ = tracing_log::LogTracer::init();

    let log_dir = match get_log_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to initialize log directory: {}", e);
            return;
        }
    };
    let file_appender = tracing_appender::rolling::daily(log_dir, "viaduct.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_timer(LocalTimer);
    let file_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_timer(LocalTimer);
    let default_filter = if debug_enabled() { "debug" } else { "info" };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    std::mem::forget(guard);

    tracing::info!("Log system initialized (console + file persistence)");
    if let Err(e) = cleanup_old_logs(LOG_RETENTION_DAYS) {
        tracing::warn!("failed_to_prune_old_logs: {}", e);
    }
}

fn cleanup_old_logs(retention_days: u64) -> Result<(), String> {
    let log_dir = get_log_dir()?;
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(retention_days * 24 * 3600);

    let entries = fs::read_dir(&log_dir).map_err(|e| format!("failed_to_read_log_dir: {}", e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified()).ok();
        if let Some(modified) = modified {
            if modified < cutoff {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::debug!("failed_to_remove_old_log {}: {}", path.display(), e);
                }
            }
        }
    }
    Ok(())
}
