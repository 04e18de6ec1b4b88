//! Normalization of captured activity into event drafts.
//!
//! Server-side domain events know their routing and metric impacts;
//! browser-reported behaviors carry only an action name and loose
//! metadata and get the action's default routing.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::engine::EngineId;
use crate::error::{Result, SyncError};
use crate::event::{BehaviorAction, EventDraft};

/// Engines an action is routed to when the caller names none.
pub fn default_targets(action: BehaviorAction) -> BTreeSet<EngineId> {
    let engines: &[EngineId] = match action {
        BehaviorAction::ArtworkCreated => &[EngineId::Huraii, EngineId::Archer],
        BehaviorAction::MediaUploaded => &[EngineId::Huraii, EngineId::Horace],
        BehaviorAction::PurchaseCompleted => &[EngineId::Cloe, EngineId::Archer],
        BehaviorAction::DaoParticipation => &[EngineId::Thorius, EngineId::Archer],
        BehaviorAction::UserActivity
        | BehaviorAction::PageView
        | BehaviorAction::UserInteraction => &[EngineId::Archer],
    };
    engines.iter().copied().collect()
}

/// Rough 0–100 effort score for a new artwork.
pub fn estimate_complexity(content_length: usize, image_attachments: usize) -> f64 {
    (content_length as f64 / 100.0 + image_attachments as f64 * 10.0).min(100.0)
}

fn default_voting_power() -> f64 {
    1.0
}

fn default_session_duration() -> u64 {
    15
}

/// Activity observed by the host application.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DomainEvent {
    ArtworkCreated {
        user_id: u64,
        artwork_id: u64,
        #[serde(default)]
        title: String,
        #[serde(default)]
        status: String,
        #[serde(default)]
        content_length: usize,
        #[serde(default)]
        image_attachments: usize,
    },
    MediaUploaded {
        user_id: u64,
        attachment_id: u64,
        #[serde(default)]
        file_type: Option<String>,
        #[serde(default)]
        file_size: u64,
    },
    PurchaseCompleted {
        user_id: u64,
        order_id: u64,
        total_amount: f64,
        #[serde(default)]
        items_count: u32,
        #[serde(default)]
        payment_method: Option<String>,
    },
    DaoParticipation {
        user_id: u64,
        proposal_id: u64,
        vote: String,
        #[serde(default = "default_voting_power")]
        voting_power: f64,
    },
    UserActivity {
        user_id: u64,
        #[serde(default)]
        page_url: String,
        #[serde(default = "default_session_duration")]
        session_duration: u64,
    },
    PageView {
        user_id: u64,
        #[serde(default)]
        object_id: u64,
        #[serde(default)]
        page_url: String,
    },
}

impl DomainEvent {
    pub fn action(&self) -> BehaviorAction {
        match self {
            DomainEvent::ArtworkCreated { .. } => BehaviorAction::ArtworkCreated,
            DomainEvent::MediaUploaded { .. } => BehaviorAction::MediaUploaded,
            DomainEvent::PurchaseCompleted { .. } => BehaviorAction::PurchaseCompleted,
            DomainEvent::DaoParticipation { .. } => BehaviorAction::DaoParticipation,
            DomainEvent::UserActivity { .. } => BehaviorAction::UserActivity,
            DomainEvent::PageView { .. } => BehaviorAction::PageView,
        }
    }

    /// Routing, metric impacts and metadata for this event, stamped with
    /// the ISO-8601 capture time.
    pub fn into_draft(self, captured_at: &str) -> EventDraft {
        let action = self.action();
        let (user_id, object_id, metadata, impacts): DraftParts = match self {
            DomainEvent::ArtworkCreated {
                user_id,
                artwork_id,
                title,
                status,
                content_length,
                image_attachments,
            } => (
                user_id,
                artwork_id,
                json!({
                    "title": title,
                    "status": status,
                    "estimated_complexity": estimate_complexity(content_length, image_attachments),
                }),
                &[
                    ("creator.weekly_artwork_uploads", 1.0),
                    ("creator.artistic_growth_index", 0.5),
                ],
            ),
            DomainEvent::MediaUploaded {
                user_id,
                attachment_id,
                file_type,
                file_size,
            } => (
                user_id,
                attachment_id,
                json!({ "file_type": file_type, "file_size": file_size }),
                &[
                    ("creator.weekly_artwork_uploads", 0.5),
                    ("creator.originality_score", 1.0),
                ],
            ),
            DomainEvent::PurchaseCompleted {
                user_id,
                order_id,
                total_amount,
                items_count,
                payment_method,
            } => {
                let draft = build_draft(
                    action,
                    user_id,
                    order_id,
                    json!({
                        "total_amount": total_amount,
                        "items_count": items_count,
                        "payment_method": payment_method,
                    }),
                    &[("collector.purchase_frequency", 1.0)],
                    captured_at,
                );
                return with_impact(draft, "marketplace.trading_volume_tola", total_amount);
            }
            DomainEvent::DaoParticipation {
                user_id,
                proposal_id,
                vote,
                voting_power,
            } => (
                user_id,
                proposal_id,
                json!({ "vote_type": vote, "voting_power": voting_power }),
                &[
                    ("community.dao_proposal_engagement", 1.0),
                    ("community.trustworthiness_rating", 0.5),
                ],
            ),
            DomainEvent::UserActivity {
                user_id,
                page_url,
                session_duration,
            } => (
                user_id,
                0,
                json!({ "page_url": page_url, "session_duration": session_duration }),
                &[("marketplace.system_navigation_score", 0.1)],
            ),
            DomainEvent::PageView {
                user_id,
                object_id,
                page_url,
            } => (user_id, object_id, json!({ "page_url": page_url }), &[]),
        };
        build_draft(action, user_id, object_id, metadata, impacts, captured_at)
    }
}

/// User, object, metadata and static metric impacts of one event.
type DraftParts = (u64, u64, Value, &'static [(&'static str, f64)]);

fn build_draft(
    action: BehaviorAction,
    user_id: u64,
    object_id: u64,
    metadata: Value,
    impacts: &[(&str, f64)],
    captured_at: &str,
) -> EventDraft {
    let mut metadata = match metadata {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    metadata.insert("timestamp".into(), Value::from(captured_at));
    EventDraft {
        action: Some(action),
        user_id,
        object_id,
        metadata,
        target_engines: default_targets(action),
        metric_impacts: impacts
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect(),
    }
}

fn with_impact(mut draft: EventDraft, key: &str, delta: f64) -> EventDraft {
    draft.metric_impacts.insert(key.to_string(), delta);
    draft
}

/// How a browser-reported interaction was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionType {
    Click,
    Mousemove,
}

impl InteractionType {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionType::Click => "click",
            InteractionType::Mousemove => "mousemove",
        }
    }
}

/// One entry of a `/sync` batch as sent by the tracking script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientBehavior {
    pub action: String,
    pub user_id: u64,
    #[serde(default)]
    pub object_id: u64,
    #[serde(default)]
    pub interaction_type: Option<InteractionType>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default, alias = "ai_targets")]
    pub target_engines: Option<Vec<String>>,
    #[serde(default)]
    pub metric_impacts: BTreeMap<String, f64>,
}

impl ClientBehavior {
    /// Resolve names and defaults. Unknown actions or engines and
    /// non-object metadata are validation errors.
    pub fn into_draft(self) -> Result<EventDraft> {
        let action: BehaviorAction = self.action.parse()?;

        let mut metadata = match self.metadata {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(SyncError::Validation(
                    "metadata must be a JSON object".into(),
                ));
            }
        };
        if let Some(kind) = self.interaction_type {
            metadata.insert("interaction_type".into(), Value::from(kind.as_str()));
        }

        let target_engines = match self.target_engines {
            Some(names) => names
                .iter()
                .map(|n| n.parse::<EngineId>())
                .collect::<Result<BTreeSet<_>>>()?,
            None => default_targets(action),
        };

        Ok(EventDraft {
            action: Some(action),
            user_id: self.user_id,
            object_id: self.object_id,
            metadata,
            target_engines,
            metric_impacts: self.metric_impacts,
        })
    }
}
