//! Per-key sliding-window rate limiting for outbound probes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::config::RateLimitConfig;

/// Allows at most `max_calls` per `period` for each key (an IP address in practice).
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_second(max_calls: u32) -> Self {
        Self::new(max_calls as usize, Duration::from_secs(1))
    }

    /// Record a call for `key` if the window has room.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut calls = match self.calls.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = calls.entry(key.to_string()).or_default();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.period)
        {
            window.pop_front();
        }
        if window.len() < self.max_calls {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the oldest call in the window for `key` expires.
    pub fn wait_time(&self, key: &str) -> Duration {
        let calls = match self.calls.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        calls
            .get(key)
            .and_then(|w| w.front())
            .map(|oldest| self.period.saturating_sub(oldest.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Wait until a call for `key` is allowed, then record it.
    pub async fn acquire(&self, key: &str) {
        while !self.allow(key) {
            let wait = self.wait_time(key).max(Duration::from_millis(1));
            trace!(key, wait_ms = wait.as_millis() as u64, "rate limited");
            sleep(wait).await;
        }
    }
}

/// The two limiters shared by collectors: raw socket probes and HTTP requests.
#[derive(Debug, Clone)]
pub struct Limiters {
    pub scan: Arc<RateLimiter>,
    pub http: Arc<RateLimiter>,
}

impl Limiters {
    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self {
            scan: Arc::new(RateLimiter::per_second(cfg.scan_calls_per_sec)),
            http: Arc::new(RateLimiter::per_second(cfg.http_calls_per_sec)),
        }
    }
}

impl Default for Limiters {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
