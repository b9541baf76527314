//! Fixed-window rate limiting for UI-disturbing operations.

use std::time::{Duration, Instant};

use tracing::warn;

/// Counts operations in fixed windows. When the quota is exceeded the first
/// overage in a window logs once; further overages stay quiet to avoid a
/// guest spamming the journal.
pub struct FixedWindowLimiter {
    name: &'static str,
    window: Duration,
    quota: u32,
    window_start: Instant,
    count: u32,
    logged_overage: bool,
}

impl FixedWindowLimiter {
    pub fn new(name: &'static str, window: Duration, quota: u32) -> Self {
        Self {
            name,
            window,
            quota,
            window_start: Instant::now(),
            count: 0,
            logged_overage: false,
        }
    }

    /// Records one operation; returns false when it exceeds the quota for
    /// the current window.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
            self.logged_overage = false;
        }

        self.count += 1;
        if self.count <= self.quota {
            return true;
        }

        if !self.logged_overage {
            warn!(
                limiter = self.name,
                quota = self.quota,
                "rate limit exceeded; suppressing further log lines this window"
            );
            self.logged_overage = true;
        }
        false
    }
}
