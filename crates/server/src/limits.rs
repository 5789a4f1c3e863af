// Fixed-window rate limiting for subscription token issuance.
//
// Lifetime-scoped and injected (constructed at service start, reset in
// tests); window cleanup runs on a best-effort timer that deterministic
// test environments simply never start.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Per-key fixed-window counter.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window_seconds: i64) -> Self {
        Self {
            max_per_window,
            window: Duration::seconds(window_seconds),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one request for `key_hash`, or return the seconds until the
    /// current window resets.
    pub fn check(&self, key_hash: &str, now: DateTime<Utc>) -> Result<(), i64> {
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let window = windows
            .entry(key_hash.to_string())
            .or_insert(Window { started_at: now, count: 0 });

        if now - window.started_at >= self.window {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.max_per_window {
            let retry_after = (window.started_at + self.window - now).num_seconds().max(1);
            return Err(retry_after);
        }

        window.count += 1;
        Ok(())
    }

    /// Drop windows that have fully elapsed. Called from the periodic
    /// cleanup timer.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = windows.len();
        windows.retain(|_, window| now - window.started_at < self.window);
        before - windows.len()
    }

    /// Clear all state for test isolation.
    pub fn reset(&self) {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::RateLimiter;

    fn ts(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().expect("timestamp should be valid")
    }

    #[test]
    fn admits_up_to_the_window_budget_then_rejects() {
        let limiter = RateLimiter::new(3, 60);
        let now = ts(1_700_000_000);

        for _ in 0..3 {
            limiter.check("key-a", now).expect("within budget should be admitted");
        }

        let retry_after = limiter.check("key-a", now).expect_err("over budget must be rejected");
        assert_eq!(retry_after, 60);

        // a different key has its own window
        limiter.check("key-b", now).expect("other keys should be unaffected");
    }

    #[test]
    fn window_resets_after_it_elapses() {
        let limiter = RateLimiter::new(1, 60);
        let now = ts(1_700_000_000);

        limiter.check("key-a", now).expect("first request should be admitted");
        limiter.check("key-a", now).expect_err("second request must be rejected");

        let later = now + Duration::seconds(60);
        limiter.check("key-a", later).expect("new window should admit again");
    }

    #[test]
    fn retry_after_counts_down_within_the_window() {
        let limiter = RateLimiter::new(1, 60);
        let now = ts(1_700_000_000);

        limiter.check("key-a", now).expect("first request should be admitted");
        let retry_after = limiter
            .check("key-a", now + Duration::seconds(45))
            .expect_err("still inside the window");
        assert_eq!(retry_after, 15);
    }

    #[test]
    fn purge_and_reset_clear_state() {
        let limiter = RateLimiter::new(1, 60);
        let now = ts(1_700_000_000);

        limiter.check("key-a", now).expect("request should be admitted");
        assert_eq!(limiter.purge_expired(now + Duration::seconds(61)), 1);

        limiter.check("key-a", now).expect("request should be admitted");
        limiter.reset();
        limiter.check("key-a", now).expect("reset should clear the window");
    }
}
