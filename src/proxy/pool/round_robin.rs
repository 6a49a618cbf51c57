use super::strategy::*;
use crate::models::Account;
use async_trait::async_trait;
use std::sync::Mutex;

pub struct RoundRobinStrategy {
    cursor: Mutex<usize>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SelectionStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    async fn select(&self, accounts: &[Account], model: &str) -> Selection {
        if accounts.is_empty() {
            return Selection::empty();
        }
        let now = now_ms();
        let mut cursor = match self.cursor.lock() {
            Ok(c) => c,
            Err(_) => return Selection::empty(),
        };

        // One full sweep from the cursor, skipping ineligible entries.
        for offset in 0..accounts.len() {
            let idx = (*cursor + offset) % accounts.len();
            let candidate = &accounts[idx];
            if is_eligible(candidate, model, now) {
                *cursor = (idx + 1) % accounts.len();
                return Selection::account(candidate.clone());
            }
        }

        let wait = min_reset_wait_ms(accounts, model, now);
        if wait > 0 {
            Selection::wait(wait)
        } else {
            Selection::empty()
        }
    }

    fn notify_success(&self, _email: &str, _model: &str) {}
    fn notify_rate_limit(&self, _email: &str, _model: &str) {}
    fn notify_failure(&self, _email: &str, _model: &str) {}
}
