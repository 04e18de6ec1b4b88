/// Priority every event starts from before action/engine bonuses.
pub const BASE_PRIORITY: u8 = 5;

/// Bonus for actions that move money, creations or governance.
pub const HIGH_PRIORITY_ACTION_BONUS: u8 = 3;

/// Bonus when any GPU-class engine is among the targets.
pub const GPU_ENGINE_BONUS: u8 = 2;

/// Upper bound on event priority.
pub const MAX_PRIORITY: u8 = 10;

/// Events at or above this priority skip the batch timer.
pub const IMMEDIATE_DISPATCH_PRIORITY: u8 = 8;

/// Delivery attempts allowed before an event is marked failed.
pub const MAX_ATTEMPTS: u32 = 3;

/// Consecutive failures that take an engine offline.
pub const OFFLINE_ERROR_THRESHOLD: u32 = 5;

/// Default number of events popped per flush.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default seconds between batch flushes.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;

/// Default seconds between engine health rounds.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;

/// Timeout for a single `/health` check.
pub const HEALTH_TIMEOUT_SECS: u64 = 5;

/// Default per-engine in-flight request cap.
pub const DEFAULT_ENGINE_CONCURRENCY: usize = 4;

/// Default lifetime of a cached user context.
pub const DEFAULT_CONTEXT_TTL_SECS: u64 = 300;

/// Default request budget per one-minute window.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;

/// Confidence recorded when an engine reply does not carry one.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Bearer token used when no token is configured for an engine.
pub const DEFAULT_ENGINE_TOKEN: &str = "default-token";
