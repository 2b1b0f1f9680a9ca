use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Fixed-window rate limiter keyed by requester id.
///
/// One token per user per window. The check-and-consume runs as a single
/// critical section so two concurrent requests from the same user cannot both
/// pass, and a rejected request neither consumes nor refreshes the token.
#[derive(Debug)]
pub struct CooldownMap {
    window: Duration,
    buckets: Mutex<HashMap<u64, Instant>>,
}

impl CooldownMap {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consume the user's token, or report how long until it refills.
    pub fn try_acquire(&self, user_id: u64) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(last) = buckets.get(&user_id) {
            let elapsed = now.duration_since(*last);
            if elapsed < self.window {
                return Err(self.window - elapsed);
            }
        }
        buckets.insert(user_id, now);
        Ok(())
    }
}
