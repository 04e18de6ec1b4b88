//! Behavior synchronization core.
//!
//! Captured user activity becomes prioritized [`BehaviorEvent`]s that are
//! routed to a fixed roster of analysis engines, retried a bounded number
//! of times, and folded back into per-user metric totals. Engine health is
//! tracked by a small connection state machine fed by health and dispatch
//! outcomes alike.
//!
//! Zero I/O: no clocks read outside [`time`], no sockets, no files. The
//! binary crate owns transport, scheduling and persistence.

pub mod cache;
pub mod capture;
pub mod connection;
pub mod constants;
pub mod engine;
pub mod error;
pub mod event;
pub mod insight;
pub mod metrics;
pub mod queue;
pub mod ratelimit;
pub mod session;
pub mod stats;
pub mod time;
pub mod wire;

pub use cache::TtlCache;
pub use capture::{
    ClientBehavior, DomainEvent, InteractionType, default_targets, estimate_complexity,
};
pub use connection::{
    ConnectionState, ConnectionTable, EngineConnectionStatus, StatusSummary, Transition,
};
pub use constants::{
    DEFAULT_BATCH_SIZE, IMMEDIATE_DISPATCH_PRIORITY, MAX_ATTEMPTS, MAX_PRIORITY,
    OFFLINE_ERROR_THRESHOLD,
};
pub use engine::{EngineClass, EngineId, EngineSpec, Specialization};
pub use error::{Result, SyncError};
pub use event::{
    BehaviorAction, BehaviorEvent, DeliveryState, EngineAttempt, EventDraft, StoredEvent,
    Verdict, compute_priority,
};
pub use insight::Insight;
pub use metrics::MetricTotals;
pub use queue::PriorityQueue;
pub use ratelimit::FixedWindowLimiter;
pub use session::{ClientMeta, SessionData};
pub use stats::DispatchStats;
pub use wire::{
    DispatchRequest, EnginePayload, EngineReply, EngineResponse, JourneyStage, UserContext,
    parse_reply,
};
