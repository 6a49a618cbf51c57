use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::{Duration, Instant};

// Delay floors and buffers, in milliseconds.
const MIN_DELAY_MS: u64 = 500;
const NETWORK_LATENCY_BUFFER_MS: u64 = 200;
const SERVER_DELAY_FLOOR_MS: u64 = 2_000;

// Dedup windows.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(2);
const STATE_RESET_WINDOW: Duration = Duration::from_secs(120);
const ESCALATION_CAP_MS: u64 = 60_000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// Progressive lockouts for quota exhaustion, indexed by consecutive failures.
const QUOTA_BACKOFF_TIERS_MS: [u64; 4] = [60_000, 300_000, 1_800_000, 7_200_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    QuotaExhausted,
    ModelCapacityExhausted,
    ServerError,
    PermanentAuth,
    InvalidRequest,
    Unknown,
}

static QUOTA_RESET_DELAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""?quotaResetDelay"?\s*[:=]\s*"?([0-9a-zA-Z.]+)"?"#).unwrap());
static QUOTA_RESET_TS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""?quotaResetTimeStamp"?\s*[:=]\s*"?([0-9T:.+Zz-]+?)"?[,}\s]"#).unwrap()
});
static RETRY_DELAY_SECS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""?retryDelay"?\s*[:=]\s*"?(\d+(?:\.\d+)?)s"?"#).unwrap());
static RETRY_AFTER_MS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"?retry[-_]after[-_]ms"?\s*[:=]\s*"?(\d+)"?"#).unwrap());
static RETRY_FREEFORM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry(?:\s+after)?\s+(\d+)\s*(?:sec(?:onds?)?|s)\b").unwrap());
static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)\b|\b(\d+(?:\.\d+)?)ms\b").unwrap()
});
static RESET_ISO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)reset:?\s*(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))")
        .unwrap()
});

// A computed delay of zero still means "come back", never "hammer now".
fn normalize_delay_ms(raw_ms: i64) -> u64 {
    if raw_ms <= 0 {
        return MIN_DELAY_MS;
    }
    let raw_ms = raw_ms as u64;
    if raw_ms < MIN_DELAY_MS {
        raw_ms + NETWORK_LATENCY_BUFFER_MS
    } else {
        raw_ms
    }
}

fn parse_http_date_delta_ms(value: &str) -> Option<i64> {
    let parsed = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    Some(parsed.timestamp_millis() - chrono::Utc::now().timestamp_millis())
}

fn parse_iso_delta_ms(value: &str) -> Option<i64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(value).ok()?;
    Some(parsed.timestamp_millis() - chrono::Utc::now().timestamp_millis())
}

// Suffixed scalar like "530ms" or "42s"; compound forms go through
// parse_compound_duration_ms.
fn parse_suffixed_ms(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Some(ms) = trimmed.strip_suffix("ms") {
        return ms.parse::<f64>().ok().map(|v| v.ceil() as i64);
    }
    if let Some(secs) = trimmed.strip_suffix('s') {
        return secs.parse::<f64>().ok().map(|v| (v * 1000.0).ceil() as i64);
    }
    trimmed.parse::<f64>().ok().map(|v| (v * 1000.0).ceil() as i64)
}

fn parse_compound_duration_ms(body: &str) -> Option<i64> {
    let caps = DURATION_RE.captures(body)?;
    if let Some(ms) = caps.get(4) {
        return ms.as_str().parse::<f64>().ok().map(|v| v.ceil() as i64);
    }
    let hours: i64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let minutes: i64 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let seconds: f64 = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0);
    let total_ms = hours * 3_600_000 + minutes * 60_000 + (seconds * 1000.0).ceil() as i64;
    if total_ms > 0 {
        Some(total_ms)
    } else {
        None
    }
}

fn parse_reset_from_body_ms(body: &str) -> Option<i64> {
    // Order matters: stop on the first rule that produces a value.
    if let Some(caps) = QUOTA_RESET_DELAY_RE.captures(body) {
        if let Some(ms) = parse_suffixed_ms(&caps[1]) {
            return Some(ms);
        }
    }
    if let Some(caps) = QUOTA_RESET_TS_RE.captures(body) {
        if let Some(delta) = parse_iso_delta_ms(&caps[1]) {
            return Some(delta);
        }
    }
    if let Some(caps) = RETRY_DELAY_SECS_RE.captures(body) {
        if let Ok(secs) = caps[1].parse::<f64>() {
            return Some((secs * 1000.0).ceil() as i64);
        }
    }
    if let Some(caps) = RETRY_AFTER_MS_RE.captures(body) {
        if let Ok(ms) = caps[1].parse::<i64>() {
            return Some(ms);
        }
    }
    if let Some(caps) = RETRY_FREEFORM_RE.captures(body) {
        if let Ok(secs) = caps[1].parse::<i64>() {
            return Some(secs * 1000);
        }
    }
    if let Some(ms) = parse_compound_duration_ms(body) {
        return Some(ms);
    }
    if let Some(caps) = RESET_ISO_RE.captures(body) {
        if let Some(delta) = parse_iso_delta_ms(&caps[1]) {
            return Some(delta);
        }
    }
    None
}

// Extract a reset delay from headers (by precedence) or the error body.
// Returns a normalized delay in milliseconds, or None when nothing applies.
pub fn parse_reset_delay_ms(
    retry_after: Option<&str>,
    ratelimit_reset: Option<&str>,
    ratelimit_reset_after: Option<&str>,
    body: &str,
) -> Option<u64> {
    if let Some(value) = retry_after {
        if let Ok(secs) = value.trim().parse::<i64>() {
            return Some(normalize_delay_ms(secs * 1000));
        }
        if let Some(delta) = parse_http_date_delta_ms(value) {
            return Some(normalize_delay_ms(delta));
        }
    }
    if let Some(value) = ratelimit_reset {
        if let Ok(unix_secs) = value.trim().parse::<i64>() {
            let delta = unix_secs * 1000 - chrono::Utc::now().timestamp_millis();
            return Some(normalize_delay_ms(delta));
        }
    }
    if let Some(value) = ratelimit_reset_after {
        if let Ok(secs) = value.trim().parse::<f64>() {
            return Some(normalize_delay_ms((secs * 1000.0).ceil() as i64));
        }
    }
    parse_reset_from_body_ms(body).map(normalize_delay_ms)
}

fn has_capacity_wording(lowered: &str) -> bool {
    lowered.contains("capacity")
        || lowered.contains("overloaded")
        || lowered.contains("model_capacity_exhausted")
}

// Status overrides first, then case-insensitive substring rules.
pub fn classify(status: u16, body: &str) -> ErrorKind {
    let lowered = body.to_lowercase();

    if status == 529 || (status == 503 && has_capacity_wording(&lowered)) {
        return ErrorKind::ModelCapacityExhausted;
    }
    if status == 500 {
        return ErrorKind::ServerError;
    }
    if status == 400 {
        return ErrorKind::InvalidRequest;
    }

    if lowered.contains("invalid_grant")
        || lowered.contains("token has been expired or revoked")
        || lowered.contains("token revoked")
        || lowered.contains("invalid_client")
        || lowered.contains("credentials are invalid")
    {
        return ErrorKind::PermanentAuth;
    }
    if lowered.contains("quota") || lowered.contains("daily limit") {
        return ErrorKind::QuotaExhausted;
    }
    if has_capacity_wording(&lowered) {
        return ErrorKind::ModelCapacityExhausted;
    }
    if lowered.contains("rate limit")
        || lowered.contains("rate_limit")
        || lowered.contains("too many")
        || lowered.contains("throttl")
    {
        return ErrorKind::RateLimit;
    }
    if lowered.contains("internal server error")
        || lowered.contains("internal error")
        || lowered.contains("service unavailable")
        || (500..600).contains(&status)
    {
        return ErrorKind::ServerError;
    }
    ErrorKind::Unknown
}

// Error-kind-specific delay chosen when the server provides no hint; a
// server-provided delay always wins, floored at 2 seconds.
pub fn smart_backoff_ms(
    kind: ErrorKind,
    server_delay_ms: Option<u64>,
    consecutive_failures: u32,
) -> u64 {
    if let Some(delay) = server_delay_ms {
        return delay.max(SERVER_DELAY_FLOOR_MS);
    }

    match kind {
        ErrorKind::QuotaExhausted => {
            let index = (consecutive_failures.max(1) as usize - 1)
                .min(QUOTA_BACKOFF_TIERS_MS.len() - 1);
            QUOTA_BACKOFF_TIERS_MS[index]
        }
        ErrorKind::ModelCapacityExhausted => {
            use rand::Rng;
            let jitter: i64 = rand::thread_rng().gen_range(-5_000..=5_000);
            (15_000_i64 + jitter).max(MIN_DELAY_MS as i64) as u64
        }
        ErrorKind::RateLimit => 30_000,
        ErrorKind::ServerError => 20_000,
        _ => 60_000,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DedupVerdict {
    pub attempt: u32,
    pub delay_ms: u64,
    // Within the 2-second window of the previous 429: the caller should
    // switch accounts instead of retrying.
    pub is_duplicate: bool,
}

struct DedupEntry {
    attempt: u32,
    last_hit: Instant,
}

// Process-wide 429 deduplication keyed by (email, model). Shared across all
// in-flight attempts; a periodic sweeper evicts idle entries.
pub struct RateLimitDedup {
    entries: DashMap<String, DedupEntry>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimitDedup {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    pub fn global() -> &'static RateLimitDedup {
        static INSTANCE: once_cell::sync::OnceCell<RateLimitDedup> = once_cell::sync::OnceCell::new();
        INSTANCE.get_or_init(RateLimitDedup::new)
    }

    fn key(email: &str, model: &str) -> String {
        format!("{}:{}", email, model)
    }

    // Register a 429 for (email, model) and decide how to treat it.
    pub fn register(&self, email: &str, model: &str, base_delay_ms: u64) -> DedupVerdict {
        let key = Self::key(email, model);
        let now = Instant::now();
        let mut entry = self.entries.entry(key).or_insert(DedupEntry {
            attempt: 0,
            last_hit: now.checked_sub(STATE_RESET_WINDOW).unwrap_or(now),
        });

        let elapsed = now.duration_since(entry.last_hit);
        if elapsed <= DUPLICATE_WINDOW && entry.attempt > 0 {
            tracing::debug!(
                "[RateLimit-Dedup] Duplicate 429 for {}/{} within {:?}",
                email,
                model,
                elapsed
            );
            entry.last_hit = now;
            return DedupVerdict {
                attempt: entry.attempt,
                delay_ms: base_delay_ms,
                is_duplicate: true,
            };
        }

        if elapsed > STATE_RESET_WINDOW {
            entry.attempt = 0;
        }
        entry.attempt += 1;
        entry.last_hit = now;

        let factor = 2_u64.saturating_pow(entry.attempt.saturating_sub(1));
        let escalated = base_delay_ms
            .max(base_delay_ms.saturating_mul(factor))
            .min(ESCALATION_CAP_MS);

        tracing::debug!(
            "[RateLimit-Dedup] 429 #{} for {}/{}, delay {}ms",
            entry.attempt,
            email,
            model,
            escalated
        );

        DedupVerdict {
            attempt: entry.attempt,
            delay_ms: escalated,
            is_duplicate: false,
        }
    }

    pub fn clear(&self, email: &str, model: &str) {
        self.entries.remove(&Self::key(email, model));
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_hit) <= STATE_RESET_WINDOW);
        before - self.entries.len()
    }

    // Start the background sweeper; idempotent.
    pub fn start_sweeper(&'static self) {
        let mut guard = self.sweeper.lock().expect("dedup sweeper lock");
        if guard.is_some() {
            return;
        }
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let evicted = self.sweep();
                if evicted > 0 {
                    tracing::debug!("[RateLimit-Dedup] Swept {} idle entries", evicted);
                }
            }
        }));
    }

    pub fn stop_sweeper(&self) {
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    #[cfg(test)]
    fn reset_for_test(&self) {
        self.entries.clear();
    }
}
