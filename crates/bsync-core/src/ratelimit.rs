//! Fixed one-minute window request limiter.

const WINDOW_MILLIS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct FixedWindowLimiter {
    limit: u32,
    window_start: u64,
    count: u32,
    blocked: u64,
}

impl FixedWindowLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit: limit_per_minute,
            window_start: 0,
            count: 0,
            blocked: 0,
        }
    }

    /// Count one request at `now` (Unix millis). `false` means over budget.
    pub fn check(&mut self, now: u64) -> bool {
        if now.saturating_sub(self.window_start) >= WINDOW_MILLIS {
            self.window_start = now - now % WINDOW_MILLIS;
            self.count = 0;
        }
        if self.count >= self.limit {
            self.blocked += 1;
            return false;
        }
        self.count += 1;
        true
    }

    pub fn blocked(&self) -> u64 {
        self.blocked
    }

    /// Requests still allowed in the window containing `now`.
    pub fn remaining(&self, now: u64) -> u32 {
        if now.saturating_sub(self.window_start) >= WINDOW_MILLIS {
            self.limit
        } else {
            self.limit.saturating_sub(self.count)
        }
    }
}
