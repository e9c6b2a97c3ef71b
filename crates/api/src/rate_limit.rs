//! Per-caller rate limiting for the checkout endpoints.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window rate limiter keyed by caller identity.
///
/// Timestamps outside the window are pruned on each check for the same
/// key, so the map stays proportional to the set of recently active
/// callers.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_requests` per `window` per key.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Records an attempt for `key` and returns whether it is allowed.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            // A poisoned lock means a panic elsewhere; failing open keeps
            // the limiter a defence, not an availability hazard.
            Err(poisoned) => poisoned.into_inner(),
        };

        let timestamps = attempts.entry(key.to_string()).or_default();
        timestamps.retain(|&ts| now.duration_since(ts) < self.window);

        if timestamps.len() >= self.max_requests as usize {
            tracing::warn!(key, attempts = timestamps.len(), "checkout rate limit exceeded");
            return false;
        }

        timestamps.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("caller-x"));
        assert!(limiter.check("caller-x"));
        assert!(limiter.check("caller-x"));
        assert!(!limiter.check("caller-x"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("caller-x"));
        assert!(limiter.check("caller-y"));
        assert!(!limiter.check("caller-x"));
    }

    #[test]
    fn window_expiry_frees_budget() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check("caller-x"));
        assert!(!limiter.check("caller-x"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("caller-x"));
    }
}
