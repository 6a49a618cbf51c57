use super::strategy::*;
use crate::models::Account;
use async_trait::async_trait;
use std::sync::Mutex;

// Prefers the account that served the last request, for prompt-cache
// locality. A short rate limit on the favourite is worth waiting out; a long
// one breaks stickiness.
pub struct StickyStrategy {
    last_email: Mutex<Option<String>>,
}

impl StickyStrategy {
    pub fn new() -> Self {
        Self {
            last_email: Mutex::new(None),
        }
    }

    fn remember(&self, email: &str) {
        if let Ok(mut last) = self.last_email.lock() {
            *last = Some(email.to_string());
        }
    }
}

impl Default for StickyStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SelectionStrategy for StickyStrategy {
    fn name(&self) -> &'static str {
        "sticky"
    }

    async fn select(&self, accounts: &[Account], model: &str) -> Selection {
        let now = now_ms();
        let last = self.last_email.lock().ok().and_then(|l| l.clone());

        if let Some(last_email) = last {
            if let Some(favourite) = accounts
                .iter()
                .find(|a| a.email == last_email && a.is_selectable())
            {
                if !favourite.is_rate_limited_for(model, now) {
                    return Selection::account(favourite.clone());
                }
                let wait = favourite
                    .rate_limits
                    .get(model)
                    .map(|e| (e.reset_at_ms - now).max(0) as u64)
                    .unwrap_or(0);
                if wait > 0 && wait <= STICKY_MAX_WAIT_MS {
                    tracing::debug!(
                        "[Sticky] Favourite {} limited for {}ms, suggesting wait",
                        favourite.email,
                        wait
                    );
                    return Selection::wait(wait);
                }
                tracing::debug!(
                    "[Sticky] Favourite {} limited for {}ms, switching",
                    favourite.email,
                    wait
                );
            }
        }

        if let Some(other) = accounts.iter().find(|a| is_eligible(a, model, now)) {
            self.remember(&other.email);
            return Selection::account(other.clone());
        }

        let wait = min_reset_wait_ms(accounts, model, now);
        if wait > 0 {
            Selection::wait(wait)
        } else {
            Selection::empty()
        }
    }

    fn notify_success(&self, email: &str, _model: &str) {
        self.remember(email);
    }

    fn notify_rate_limit(&self, email: &str, _model: &str) {
        if let Ok(mut last) = self.last_email.lock() {
            if last.as_deref() == Some(email) {
                *last = None;
            }
        }
    }

    fn notify_failure(&self, _email: &str, _model: &str) {}
}
