use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const VALIDATION_TTL: Duration = Duration::from_secs(5 * 60);

// Models the proxy advertises on /v1/models and accepts for dispatch.
pub const KNOWN_MODELS: &[&str] = &[
    "claude-opus-4-5-thinking",
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "gemini-3-pro-high",
    "gemini-3-pro-low",
    "gemini-3-flash",
    "gemini-2.5-flash",
    "gemini-2.5-flash-thinking",
];

struct CacheState {
    models: Option<HashSet<String>>,
    fetched_at: Instant,
}

// 5-minute model-validation cache with single-flight semantics: concurrent
// validators on a cold cache wait on one populate.
pub struct ModelValidationCache {
    state: Mutex<CacheState>,
}

impl ModelValidationCache {
    fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                models: None,
                fetched_at: Instant::now(),
            }),
        }
    }

    pub fn global() -> &'static Arc<ModelValidationCache> {
        static INSTANCE: once_cell::sync::Lazy<Arc<ModelValidationCache>> =
            once_cell::sync::Lazy::new(|| Arc::new(ModelValidationCache::new()));
        &INSTANCE
    }

    fn populate() -> HashSet<String> {
        KNOWN_MODELS.iter().map(|m| m.to_string()).collect()
    }

    // The mutex doubles as the single-flight gate: whoever holds it on a miss
    // does the populate, everyone queued behind reads the fresh value.
    pub async fn is_known(&self, model: &str) -> bool {
        let mut state = self.state.lock().await;
        let expired = state.models.is_none() || state.fetched_at.elapsed() > VALIDATION_TTL;
        if expired {
            state.models = Some(Self::populate());
            state.fetched_at = Instant::now();
        }
        state
            .models
            .as_ref()
            .map(|m| m.contains(model))
            .unwrap_or(false)
    }

    pub async fn model_ids(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        let expired = state.models.is_none() || state.fetched_at.elapsed() > VALIDATION_TTL;
        if expired {
            state.models = Some(Self::populate());
            state.fetched_at = Instant::now();
        }
        let mut ids: Vec<String> = state.models.as_ref().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }
}
