use tokio::time::{self, Duration};

const USAGE_FLUSH_INTERVAL_SECS: u64 = 60;
const USAGE_PRUNE_INTERVAL_SECS: u64 = 6 * 3600;
const POOL_PERSIST_INTERVAL_SECS: u64 = 300;

// Background passes: rate-limit dedup sweeping, usage flush/prune, periodic
// pool persistence.
pub fn start_scheduler(state: crate::proxy::state::AppState) {
    crate::proxy::ratelimit::RateLimitDedup::global().start_sweeper();

    tokio::spawn(async move {
        let mut flush_interval = time::interval(Duration::from_secs(USAGE_FLUSH_INTERVAL_SECS));
        let mut prune_interval = time::interval(Duration::from_secs(USAGE_PRUNE_INTERVAL_SECS));
        let mut persist_interval = time::interval(Duration::from_secs(POOL_PERSIST_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = flush_interval.tick() => {
                    match crate::modules::stats::usage::UsageRecorder::global().flush_if_dirty() {
                        Ok(true) => tracing::debug!("[Scheduler] Usage history flushed"),
                        Ok(false) => {}
                        Err(e) => tracing::warn!("[Scheduler] usage_flush_failed: {}", e),
                    }
                }
                _ = prune_interval.tick() => {
                    crate::modules::stats::usage::UsageRecorder::global().prune();
                }
                _ = persist_interval.tick() => {
                    let core = state.core().await;
                    if let Err(e) = core.pool.save_to_disk().await {
                        tracing::warn!("[Scheduler] pool_persist_failed: {}", e);
                    }
                }
            }
        }
    });
}

pub fn stop_scheduler() {
    crate::proxy::ratelimit::RateLimitDedup::global().stop_sweeper();
}
