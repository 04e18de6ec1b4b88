//! Behavior events and their bounded-retry delivery state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    BASE_PRIORITY, GPU_ENGINE_BONUS, HIGH_PRIORITY_ACTION_BONUS, IMMEDIATE_DISPATCH_PRIORITY,
    MAX_ATTEMPTS, MAX_PRIORITY,
};
use crate::engine::{EngineClass, EngineId};
use crate::error::{Result, SyncError};

static METRIC_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_]+\.[a-z_]+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorAction {
    ArtworkCreated,
    MediaUploaded,
    PurchaseCompleted,
    DaoParticipation,
    UserActivity,
    PageView,
    UserInteraction,
}

impl BehaviorAction {
    pub const ALL: [BehaviorAction; 7] = [
        BehaviorAction::ArtworkCreated,
        BehaviorAction::MediaUploaded,
        BehaviorAction::PurchaseCompleted,
        BehaviorAction::DaoParticipation,
        BehaviorAction::UserActivity,
        BehaviorAction::PageView,
        BehaviorAction::UserInteraction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BehaviorAction::ArtworkCreated => "artwork_created",
            BehaviorAction::MediaUploaded => "media_uploaded",
            BehaviorAction::PurchaseCompleted => "purchase_completed",
            BehaviorAction::DaoParticipation => "dao_participation",
            BehaviorAction::UserActivity => "user_activity",
            BehaviorAction::PageView => "page_view",
            BehaviorAction::UserInteraction => "user_interaction",
        }
    }

    /// Creations, purchases and governance votes jump the queue.
    pub fn is_high_priority(self) -> bool {
        matches!(
            self,
            BehaviorAction::ArtworkCreated
                | BehaviorAction::PurchaseCompleted
                | BehaviorAction::DaoParticipation
        )
    }
}

impl fmt::Display for BehaviorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BehaviorAction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        BehaviorAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| SyncError::Validation(format!("unknown action '{s}'")))
    }
}

/// Priority of an event: a pure function of its action and target set.
///
/// Base 5, +3 for high-priority actions, +2 when a GPU engine is
/// targeted, capped at 10.
pub fn compute_priority(action: BehaviorAction, targets: &BTreeSet<EngineId>) -> u8 {
    let mut priority = BASE_PRIORITY;
    if action.is_high_priority() {
        priority += HIGH_PRIORITY_ACTION_BONUS;
    }
    if targets.iter().any(|e| e.class() == EngineClass::Gpu) {
        priority += GPU_ENGINE_BONUS;
    }
    priority.min(MAX_PRIORITY)
}

/// Where an event is in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending { attempts: u32 },
    Processed,
    Failed { attempts: u32 },
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending { .. } => "pending",
            DeliveryState::Processed => "processed",
            DeliveryState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Pending { .. })
    }
}

/// Result of offering an event to one engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAttempt {
    Accepted,
    Rejected(SyncError),
    /// Engine offline; not tried and not counted.
    Skipped,
}

/// What the dispatcher must do with an event after a delivery round.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// At least one engine accepted it.
    Delivered,
    /// Every reachable engine rejected it; back to the queue.
    Retry { attempts: u32, error: SyncError },
    /// Retry budget exhausted; carries the rejection that used it up.
    Failed { attempts: u32, last_error: SyncError },
    /// Every target was skipped; held until one is reachable, attempts
    /// unchanged.
    Deferred,
}

/// Caller-supplied fields of a new event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventDraft {
    pub action: Option<BehaviorAction>,
    pub user_id: u64,
    pub object_id: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub target_engines: BTreeSet<EngineId>,
    pub metric_impacts: BTreeMap<String, f64>,
}

/// Every field of a previously persisted event.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: Uuid,
    pub action: BehaviorAction,
    pub user_id: u64,
    pub object_id: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub target_engines: BTreeSet<EngineId>,
    pub metric_impacts: BTreeMap<String, f64>,
    pub priority: u8,
    pub queued_at: u64,
    pub state: DeliveryState,
}

/// A normalized user action bound for one or more engines.
///
/// The payload is fixed at construction; only `state` moves, and only
/// through [`BehaviorEvent::settle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehaviorEvent {
    id: Uuid,
    action: BehaviorAction,
    user_id: u64,
    object_id: u64,
    metadata: serde_json::Map<String, serde_json::Value>,
    target_engines: BTreeSet<EngineId>,
    metric_impacts: BTreeMap<String, f64>,
    priority: u8,
    queued_at: u64,
    #[serde(flatten)]
    state: DeliveryState,
}

impl BehaviorEvent {
    /// Validate a draft and stamp it with an id, priority and queue time.
    pub fn new(draft: EventDraft, queued_at: u64) -> Result<Self> {
        let action = draft
            .action
            .ok_or_else(|| SyncError::Validation("missing action".into()))?;
        if draft.user_id == 0 {
            return Err(SyncError::Validation("user_id must be positive".into()));
        }
        if draft.target_engines.is_empty() {
            return Err(SyncError::Validation(format!(
                "{action} event has no target engines"
            )));
        }
        for (key, value) in &draft.metric_impacts {
            if !METRIC_KEY.is_match(key) {
                return Err(SyncError::Validation(format!(
                    "metric key '{key}' is not of the form group.name"
                )));
            }
            if !value.is_finite() {
                return Err(SyncError::Validation(format!(
                    "metric '{key}' has a non-finite delta"
                )));
            }
        }

        let priority = compute_priority(action, &draft.target_engines);
        Ok(Self {
            id: Uuid::new_v4(),
            action,
            user_id: draft.user_id,
            object_id: draft.object_id,
            metadata: draft.metadata,
            target_engines: draft.target_engines,
            metric_impacts: draft.metric_impacts,
            priority,
            queued_at,
            state: DeliveryState::Pending { attempts: 0 },
        })
    }

    /// Rebuild an event from storage. The stored priority is kept as-is.
    pub fn restore(stored: StoredEvent) -> Self {
        Self {
            id: stored.id,
            action: stored.action,
            user_id: stored.user_id,
            object_id: stored.object_id,
            metadata: stored.metadata,
            target_engines: stored.target_engines,
            metric_impacts: stored.metric_impacts,
            priority: stored.priority.min(MAX_PRIORITY),
            queued_at: stored.queued_at,
            state: stored.state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn action(&self) -> BehaviorAction {
        self.action
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn target_engines(&self) -> &BTreeSet<EngineId> {
        &self.target_engines
    }

    pub fn metric_impacts(&self) -> &BTreeMap<String, f64> {
        &self.metric_impacts
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn queued_at(&self) -> u64 {
        self.queued_at
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        match self.state {
            DeliveryState::Pending { attempts } | DeliveryState::Failed { attempts } => attempts,
            DeliveryState::Processed => 0,
        }
    }

    pub fn wants_immediate_dispatch(&self) -> bool {
        self.priority >= IMMEDIATE_DISPATCH_PRIORITY
    }

    /// Fold one delivery round into the state machine.
    ///
    /// Any acceptance delivers the event. Otherwise the last rejection
    /// spends an attempt, and the event fails at the cap or at once if the
    /// rejection is not retryable. A round of skips defers. A terminal
    /// event ignores further rounds and reports its terminal verdict again.
    pub fn settle(&mut self, round: &[(EngineId, EngineAttempt)]) -> Verdict {
        let attempts = match self.state {
            DeliveryState::Pending { attempts } => attempts,
            DeliveryState::Processed => return Verdict::Delivered,
            DeliveryState::Failed { attempts } => {
                return Verdict::Failed {
                    attempts,
                    last_error: SyncError::Capacity { attempts },
                };
            }
        };

        if round
            .iter()
            .any(|(_, a)| matches!(a, EngineAttempt::Accepted))
        {
            self.state = DeliveryState::Processed;
            return Verdict::Delivered;
        }

        let last_error = round.iter().rev().find_map(|(engine, a)| match a {
            EngineAttempt::Rejected(e) => Some((engine, e)),
            _ => None,
        });
        let Some((engine, error)) = last_error else {
            return Verdict::Deferred;
        };
        let error = match error {
            SyncError::Transport(msg) => SyncError::Transport(format!("{engine}: {msg}")),
            SyncError::Engine { status, message } => SyncError::Engine {
                status: *status,
                message: format!("{engine}: {message}"),
            },
            other => other.clone(),
        };

        // A non-retryable rejection will not heal on its own; stop here.
        let attempts = attempts + 1;
        if attempts >= MAX_ATTEMPTS || !error.is_retryable() {
            self.state = DeliveryState::Failed { attempts };
            Verdict::Failed {
                attempts,
                last_error: error,
            }
        } else {
            self.state = DeliveryState::Pending { attempts };
            Verdict::Retry { attempts, error }
        }
    }
}
