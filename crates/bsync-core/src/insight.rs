//! Insights: the append-only record of what engines said about a user.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::EngineId;
use crate::wire::EngineReply;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub user_id: u64,
    pub engine: EngineId,
    pub event_id: Option<Uuid>,
    pub payload: serde_json::Value,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Seconds the engine reports spending on the analysis.
    pub processing_time: f64,
    /// Seconds the round trip took from our side.
    pub response_time: f64,
    /// Unix milliseconds.
    pub created_at: u64,
}

impl Insight {
    pub fn from_reply(
        user_id: u64,
        engine: EngineId,
        event_id: Option<Uuid>,
        reply: &EngineReply,
        response_time: f64,
        created_at: u64,
    ) -> Self {
        Self {
            user_id,
            engine,
            event_id,
            payload: reply.raw.clone(),
            confidence: reply.confidence.clamp(0.0, 1.0),
            processing_time: reply.processing_time,
            response_time,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::parse_reply;

    #[test]
    fn test_from_reply_keeps_raw_payload() {
        let body = r#"{"confidence":0.8,"processing_time":1.5,"tags":["a"]}"#;
        let reply = parse_reply(200, body).unwrap();
        let id = Uuid::new_v4();
        let insight = Insight::from_reply(9, EngineId::Horace, Some(id), &reply, 0.3, 1000);
        assert_eq!(insight.confidence, 0.8);
        assert_eq!(insight.processing_time, 1.5);
        assert_eq!(insight.response_time, 0.3);
        assert_eq!(insight.payload["tags"][0], "a");
        assert_eq!(insight.event_id, Some(id));
    }
}
