//! Rate Limiter Module
//!
//! Per-principal sliding-window counter bounding upload attempts per
//! window. In-memory and best-effort: state is process-local and lost on
//! restart, which only ever errs on the permissive side.
//!
//! Uses a `DashMap` for concurrent access from multiple Tokio tasks, keyed
//! by principal id. Each entry holds the instants of attempts inside the
//! trailing window; older instants are evicted on every check and never
//! read again.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default trailing window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default attempt ceiling per window.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Acquire calls between opportunistic idle-window eviction passes.
const EVICT_CALL_INTERVAL: u64 = 1024;

/// Outcome of attempting to consume a rate-limit slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The attempt was recorded and may proceed to the remaining checks.
    Admitted,
    /// Too many attempts in the window. Nothing was recorded, so a denied
    /// caller does not consume a second slot on retry.
    Limited {
        /// Seconds until the oldest in-window attempt ages out.
        retry_after_secs: u64,
    },
}

/// Sliding-window attempt limiter keyed by principal.
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    max_attempts: u32,
    window: Duration,
    acquire_calls: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_attempts,
            window,
            acquire_calls: AtomicU64::new(0),
        }
    }

    /// Evict expired attempts for the principal, then either record this
    /// attempt and admit, or deny with a suggested retry-after.
    pub fn try_acquire(&self, principal_id: &str) -> RateLimitDecision {
        self.try_acquire_at(principal_id, Instant::now())
    }

    /// Clock-injected variant so tests can step time deterministically.
    pub fn try_acquire_at(&self, principal_id: &str, now: Instant) -> RateLimitDecision {
        // Must run before the entry below is held: `retain` locks shards.
        if self.acquire_calls.fetch_add(1, Ordering::Relaxed) % EVICT_CALL_INTERVAL
            == EVICT_CALL_INTERVAL - 1
        {
            self.evict_idle_at(now);
        }

        let mut entry = self
            .windows
            .entry(principal_id.to_string())
            .or_insert_with(VecDeque::new);

        while let Some(oldest) = entry.front() {
            if now.duration_since(*oldest) >= self.window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() >= self.max_attempts as usize {
            let retry_after = entry
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            // Round up so callers never retry a hair too early.
            let retry_after_secs = retry_after.as_secs()
                + if retry_after.subsec_nanos() > 0 { 1 } else { 0 };
            return RateLimitDecision::Limited { retry_after_secs };
        }

        entry.push_back(now);
        RateLimitDecision::Admitted
    }

    /// Number of in-window attempts currently recorded for a principal.
    pub fn attempts_in_window(&self, principal_id: &str) -> usize {
        self.windows
            .get(principal_id)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    /// Drop window state for principals with no in-window attempts. Runs
    /// automatically every `EVICT_CALL_INTERVAL` acquire calls so the map
    /// cannot grow one entry per principal ever seen.
    pub fn evict_idle(&self) {
        self.evict_idle_at(Instant::now());
    }

    fn evict_idle_at(&self, now: Instant) {
        self.windows.retain(|_, window| {
            window
                .back()
                .map(|last| now.duration_since(*last) < self.window)
                .unwrap_or(false)
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW)
    }
}
