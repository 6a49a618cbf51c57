use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const USAGE_FILE: &str = "usage-history.json";
// Pre-rename installs wrote to this path.
const LEGACY_USAGE_FILE: &str = "usage.json";
const RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FamilyBucket {
    #[serde(flatten)]
    pub models: HashMap<String, u64>,
    #[serde(rename = "_subtotal", default)]
    pub subtotal: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HourBucket {
    #[serde(flatten)]
    pub families: HashMap<String, FamilyBucket>,
    #[serde(rename = "_total", default)]
    pub total: u64,
}

pub type UsageHistory = HashMap<String, HourBucket>;

// Counts completed requests into UTC hour buckets, keyed by model family and
// short model name. Flushed to disk by the scheduler when dirty.
pub struct UsageRecorder {
    path: PathBuf,
    history: Mutex<UsageHistory>,
    dirty: AtomicBool,
}

fn hour_bucket_key(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%dT%H:00:00Z").to_string()
}

// "claude-opus-4-5-thinking" -> ("claude", "opus-4-5-thinking")
fn split_family(model: &str) -> (String, String) {
    let family = crate::proxy::mappers::thinking::model_family(model);
    let short = model
        .strip_prefix(&format!("{}-", family))
        .unwrap_or(model)
        .to_string();
    (family.to_string(), short)
}

impl UsageRecorder {
    pub fn global() -> &'static UsageRecorder {
        static INSTANCE: once_cell::sync::OnceCell<UsageRecorder> = once_cell::sync::OnceCell::new();
        INSTANCE.get_or_init(|| {
            let dir = crate::modules::persistence::data_dir().unwrap_or_else(|e| {
                tracing::error!("[Usage] failed_to_resolve_data_dir: {}", e);
                std::env::temp_dir()
            });
            UsageRecorder::open_at(dir.join(USAGE_FILE), Some(dir.join(LEGACY_USAGE_FILE)))
        })
    }

    pub fn open_at(path: PathBuf, legacy_path: Option<PathBuf>) -> Self {
        if let Some(legacy) = legacy_path {
            if legacy.exists() && !path.exists() {
                match std::fs::rename(&legacy, &path) {
                    Ok(()) => tracing::info!(
                        "[Usage] Migrated legacy usage file {} -> {}",
                        legacy.display(),
                        path.display()
                    ),
                    Err(e) => tracing::warn!("[Usage] legacy_migration_failed: {}", e),
                }
            }
        }

        let history = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<UsageHistory>(&content).ok())
            .unwrap_or_default();

        Self {
            path,
            history: Mutex::new(history),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn record(&self, model: &str) {
        self.record_at(model, chrono::Utc::now());
    }

    fn record_at(&self, model: &str, when: chrono::DateTime<chrono::Utc>) {
        let (family, short) = split_family(model);
        let key = hour_bucket_key(when);

        if let Ok(mut history) = self.history.lock() {
            let hour = history.entry(key).or_default();
            let family_bucket = hour.families.entry(family).or_default();
            *family_bucket.models.entry(short).or_insert(0) += 1;
            family_bucket.subtotal += 1;
            hour.total += 1;
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageHistory {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    // Drop buckets beyond the retention window. Returns the evicted count.
    pub fn prune(&self) -> usize {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(RETENTION_DAYS);
        let cutoff_key = hour_bucket_key(cutoff);
        let mut evicted = 0;
        if let Ok(mut history) = self.history.lock() {
            let before = history.len();
            history.retain(|key, _| key.as_str() >= cutoff_key.as_str());
            evicted = before - history.len();
        }
        if evicted > 0 {
            self.dirty.store(true, Ordering::Relaxed);
            tracing::info!("[Usage] Pruned {} expired hour buckets", evicted);
        }
        evicted
    }

    pub fn flush_if_dirty(&self) -> Result<bool, String> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(false);
        }
        let content = {
            let history = self
                .history
                .lock()
                .map_err(|_| "usage_history_lock_poisoned".to_string())?;
            serde_json::to_string_pretty(&*history)
                .map_err(|e| format!("failed_to_serialize_usage_history: {}", e))?
        };
        crate::modules::persistence::atomic_write(&self.path, &content)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_increments_model_subtotal_and_total() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = UsageRecorder::open_at(dir.path().join("usage-history.json"), None);

        let when = chrono::Utc::now();
        recorder.record_at("claude-opus-4-5-thinking", when);
        recorder.record_at("claude-opus-4-5-thinking", when);
        recorder.record_at("gemini-3-pro-high", when);

        let history = recorder.snapshot();
        let hour = history.get(&hour_bucket_key(when)).expect("hour bucket");
        assert_eq!(hour.total, 3);
        let claude = hour.families.get("claude").expect("claude family");
        assert_eq!(claude.subtotal, 2);
        assert_eq!(claude.models.get("opus-4-5-thinking"), Some(&2));
        let gemini = hour.families.get("gemini").expect("gemini family");
        assert_eq!(gemini.models.get("3-pro-high"), Some(&1));
    }

    #[test]
    fn flush_writes_once_until_dirty_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-history.json");
        let recorder = UsageRecorder::open_at(path.clone(), None);

        assert!(!recorder.flush_if_dirty().unwrap());
        recorder.record("claude-sonnet-4-5");
        assert!(recorder.flush_if_dirty().unwrap());
        assert!(!recorder.flush_if_dirty().unwrap());
        assert!(path.exists());

        let parsed: UsageHistory =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.values().map(|h| h.total).sum::<u64>(), 1);
    }

    #[test]
    fn prune_drops_buckets_older_than_retention() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = UsageRecorder::open_at(dir.path().join("usage-history.json"), None);

        recorder.record_at(
            "claude-sonnet-4-5",
            chrono::Utc::now() - chrono::Duration::days(40),
        );
        recorder.record_at("claude-sonnet-4-5", chrono::Utc::now());

        assert_eq!(recorder.prune(), 1);
        assert_eq!(recorder.snapshot().len(), 1);
    }

    #[test]
    fn legacy_file_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("usage.json");
        let canonical = dir.path().join("usage-history.json");
        std::fs::write(
            &legacy,
            r#"{"2026-01-01T10:00:00Z":{"claude":{"sonnet-4-5":5,"_subtotal":5},"_total":5}}"#,
        )
        .unwrap();

        let recorder = UsageRecorder::open_at(canonical.clone(), Some(legacy.clone()));
        assert!(!legacy.exists());
        assert!(canonical.exists());
        let history = recorder.snapshot();
        assert_eq!(history.get("2026-01-01T10:00:00Z").unwrap().total, 5);
    }

    #[test]
    fn bucket_serde_shape_matches_wire_format() {
        let mut bucket = HourBucket::default();
        let mut family = FamilyBucket::default();
        family.models.insert("sonnet-4-5".to_string(), 2);
        family.subtotal = 2;
        bucket.families.insert("claude".to_string(), family);
        bucket.total = 2;

        let json = serde_json::to_value(&bucket).unwrap();
        assert_eq!(json["claude"]["sonnet-4-5"], 2);
        assert_eq!(json["claude"]["_subtotal"], 2);
        assert_eq!(json["_total"], 2);
    }
}
