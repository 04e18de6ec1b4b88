use serde::Serialize;

/// Counters over every engine request the dispatcher has made.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Offers skipped because the engine was offline.
    pub skipped_requests: u64,
    /// Running mean over successful requests, in seconds.
    pub average_response_time: f64,
    /// Running mean time to failure over failed requests.
    pub average_failure_time: f64,
    pub events_delivered: u64,
    pub events_failed: u64,
    pub rate_limit_blocks: u64,
}

impl DispatchStats {
    pub fn record_success(&mut self, response_time: f64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        let n = self.successful_requests as f64;
        self.average_response_time += (response_time - self.average_response_time) / n;
    }

    pub fn record_failure(&mut self, elapsed: f64) {
        self.total_requests += 1;
        self.failed_requests += 1;
        let n = self.failed_requests as f64;
        self.average_failure_time += (elapsed - self.average_failure_time) / n;
    }

    pub fn record_skip(&mut self) {
        self.skipped_requests += 1;
    }

    /// Fraction of requests that succeeded; 1.0 before any request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}
