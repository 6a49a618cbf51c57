use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

const SIGNATURE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const MIN_SIGNATURE_LENGTH: usize = 50;
const FAMILY_CACHE_LIMIT: usize = 200;

#[derive(Clone, Debug)]
struct CacheEntry {
    family: String,
    timestamp: SystemTime,
}

impl CacheEntry {
    fn new(family: String) -> Self {
        Self {
            family,
            timestamp: SystemTime::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.timestamp.elapsed().unwrap_or(Duration::ZERO) > SIGNATURE_TTL
    }
}

// Maps each thinking signature seen from upstream to the model family that
// issued it. Signatures are only valid within their own family; the mapper
// consults this cache when a conversation crosses families.
pub struct SignatureCache {
    families: Mutex<HashMap<String, CacheEntry>>,
}

impl SignatureCache {
    fn new() -> Self {
        Self {
            families: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static SignatureCache {
        static INSTANCE: OnceLock<SignatureCache> = OnceLock::new();
        INSTANCE.get_or_init(SignatureCache::new)
    }

    pub fn cache_family(&self, signature: String, family: String) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }

        if let Ok(mut cache) = self.families.lock() {
            cache.insert(signature, CacheEntry::new(family));
            if cache.len() > FAMILY_CACHE_LIMIT {
                let before = cache.len();
                cache.retain(|_, v| !v.is_expired());
                let after = cache.len();
                if before != after {
                    tracing::debug!(
                        "[SignatureCache] Cleanup: {} -> {} entries",
                        before,
                        after
                    );
                }
            }
        }
    }

    pub fn family_of(&self, signature: &str) -> Option<String> {
        if let Ok(cache) = self.families.lock() {
            if let Some(entry) = cache.get(signature) {
                if !entry.is_expired() {
                    return Some(entry.family.clone());
                }
                tracing::debug!("[SignatureCache] Entry expired for signature");
            }
        }
        None
    }

    // Tests that assert on the global cache hold this guard so parallel
    // clears cannot race them.
    #[cfg(test)]
    pub fn test_guard() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn clear(&self) {
        if let Ok(mut cache) = self.families.lock() {
            cache.clear();
        }
    }

    #[cfg(test)]
    fn expire_all_for_test(&self) {
        if let Ok(mut cache) = self.families.lock() {
            for entry in cache.values_mut() {
                entry.timestamp = SystemTime::now() - SIGNATURE_TTL - Duration::from_secs(1);
            }
        }
    }
}
