//! JSON shapes exchanged with analysis engines.
//!
//! Requests carry the event, a snapshot of the user's context and the
//! event's declared metric impacts. Replies are loose JSON objects; only a
//! handful of keys are interpreted and the rest is kept verbatim for the
//! insight log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_CONFIDENCE;
use crate::engine::{EngineSpec, Specialization};
use crate::error::{Result, SyncError};
use crate::event::BehaviorEvent;
use crate::session::SessionData;

pub const HEADER_ENGINE_TYPE: &str = "X-Engine-Type";
pub const HEADER_USER_ID: &str = "X-User-ID";
pub const HEADER_PRIORITY: &str = "X-Priority";

/// Longest engine error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStage {
    Unregistered,
    Onboarding,
    Developing,
    Established,
}

impl JourneyStage {
    /// No plan means unregistered; otherwise staged by completed milestones.
    pub fn derive(plan: Option<&str>, milestones: usize) -> Self {
        match plan.map(str::trim) {
            None | Some("") => JourneyStage::Unregistered,
            Some(_) if milestones < 3 => JourneyStage::Onboarding,
            Some(_) if milestones < 7 => JourneyStage::Developing,
            Some(_) => JourneyStage::Established,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JourneyStage::Unregistered => "unregistered",
            JourneyStage::Onboarding => "onboarding",
            JourneyStage::Developing => "developing",
            JourneyStage::Established => "established",
        }
    }
}

/// Snapshot of who the event belongs to, sent with every engine call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: u64,
    pub subscription_plan: Option<String>,
    pub journey_stage: JourneyStage,
    pub current_metrics: BTreeMap<String, f64>,
    /// Live browsing session, when the user has one.
    #[serde(default)]
    pub session_data: Option<SessionData>,
}

impl UserContext {
    pub fn new(
        user_id: u64,
        subscription_plan: Option<String>,
        completed_milestones: usize,
        current_metrics: BTreeMap<String, f64>,
    ) -> Self {
        let journey_stage =
            JourneyStage::derive(subscription_plan.as_deref(), completed_milestones);
        Self {
            user_id,
            subscription_plan,
            journey_stage,
            current_metrics,
            session_data: None,
        }
    }

    /// Context for a user with no profile and no metrics yet.
    pub fn anonymous(user_id: u64) -> Self {
        Self::new(user_id, None, 0, BTreeMap::new())
    }
}

/// Body of `POST {endpoint}/{specialization-path}`.
#[derive(Debug, Serialize)]
pub struct EnginePayload<'a> {
    pub behavior: &'a BehaviorEvent,
    pub user_context: &'a UserContext,
    pub metric_impacts: &'a BTreeMap<String, f64>,
    pub engine_specialization: Specialization,
    pub timestamp: &'a str,
}

/// Everything needed to offer one event to its engines.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub event: BehaviorEvent,
    pub user_context: UserContext,
    /// ISO-8601 send time, shared by every engine in the round.
    pub timestamp: String,
}

impl DispatchRequest {
    pub fn payload_for<'a>(&'a self, engine: &EngineSpec) -> EnginePayload<'a> {
        EnginePayload {
            behavior: &self.event,
            user_context: &self.user_context,
            metric_impacts: self.event.metric_impacts(),
            engine_specialization: engine.specialization(),
            timestamp: &self.timestamp,
        }
    }

    /// Header pairs besides `Authorization`.
    pub fn headers_for(&self, engine: &EngineSpec) -> [(&'static str, String); 3] {
        [
            (HEADER_ENGINE_TYPE, engine.class().as_str().to_string()),
            (HEADER_USER_ID, self.event.user_id().to_string()),
            (HEADER_PRIORITY, self.event.priority().to_string()),
        ]
    }
}

/// The interpreted part of an engine's 200 reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineReply {
    pub metric_updates: BTreeMap<String, f64>,
    pub ranking_impact: bool,
    pub confidence: f64,
    pub processing_time: f64,
    /// The reply object exactly as received.
    pub raw: serde_json::Value,
}

/// Outcome of one engine call, successful or not, with the observed
/// latency. Exactly one of `data` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EngineReply>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "error_text"
    )]
    pub error: Option<SyncError>,
    /// Seconds from request start to full body, or to the failure.
    pub response_time: f64,
}

fn error_text<S: serde::Serializer>(
    error: &Option<SyncError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.collect_str(e),
        None => serializer.serialize_none(),
    }
}

impl EngineResponse {
    pub fn ok(reply: EngineReply, response_time: f64) -> Self {
        Self {
            success: true,
            data: Some(reply),
            error: None,
            response_time,
        }
    }

    pub fn failed(error: SyncError, response_time: f64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            response_time,
        }
    }
}

/// Interpret an HTTP status and body from an engine.
///
/// Anything but 200 is an engine error carrying a truncated body. A 200
/// whose body is not a JSON object is also an engine error.
pub fn parse_reply(status: u16, body: &str) -> Result<EngineReply> {
    if status != 200 {
        return Err(SyncError::Engine {
            status,
            message: truncate(body.trim(), MAX_ERROR_BODY),
        });
    }

    let raw: serde_json::Value = serde_json::from_str(body).map_err(|e| SyncError::Engine {
        status,
        message: format!("invalid JSON reply: {e}"),
    })?;
    let Some(obj) = raw.as_object() else {
        return Err(SyncError::Engine {
            status,
            message: "reply is not a JSON object".into(),
        });
    };

    let metric_updates = obj
        .get("metric_updates")
        .and_then(|v| v.as_object())
        .map(|updates| {
            updates
                .iter()
                .filter_map(|(k, v)| v.as_f64().filter(|x| x.is_finite()).map(|x| (k.clone(), x)))
                .collect()
        })
        .unwrap_or_default();
    let ranking_impact = obj
        .get("ranking_impact")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let confidence = obj
        .get("confidence")
        .and_then(|v| v.as_f64())
        .filter(|c| c.is_finite())
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0);
    let processing_time = obj
        .get("processing_time")
        .and_then(|v| v.as_f64())
        .filter(|t| t.is_finite() && *t >= 0.0)
        .unwrap_or(0.0);

    Ok(EngineReply {
        metric_updates,
        ranking_impact,
        confidence,
        processing_time,
        raw,
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
