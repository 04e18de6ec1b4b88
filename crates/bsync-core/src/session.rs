//! Per-user browsing session, sent to engines alongside the user context.
//!
//! A session is opened by the first captured event for a user and extended
//! by every later one. The service expires it after an hour of silence.

use serde::{Deserialize, Serialize};

use crate::event::{BehaviorAction, EventDraft};

/// Seconds of inactivity after which a session is forgotten.
pub const SESSION_IDLE_SECS: u64 = 3600;

/// Address recorded when the request carried none.
pub const UNKNOWN_ADDRESS: &str = "0.0.0.0";

/// What the capturing request said about the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    /// Unix seconds.
    pub session_start: u64,
    pub page_views: u64,
    pub interactions: u64,
    /// Unix seconds.
    pub last_activity: u64,
    pub current_page: String,
    pub user_agent: String,
    pub ip_address: String,
}

impl SessionData {
    pub fn start(now_secs: u64) -> Self {
        Self {
            session_start: now_secs,
            page_views: 0,
            interactions: 0,
            last_activity: now_secs,
            current_page: String::new(),
            user_agent: String::new(),
            ip_address: UNKNOWN_ADDRESS.to_string(),
        }
    }

    /// Fold one captured event into the session.
    ///
    /// Client fields are only overwritten by values the request actually
    /// carried.
    pub fn record(&mut self, draft: &EventDraft, client: &ClientMeta, now_secs: u64) {
        match draft.action {
            Some(BehaviorAction::PageView) => self.page_views += 1,
            Some(BehaviorAction::UserInteraction) => self.interactions += 1,
            _ => {}
        }
        self.last_activity = self.last_activity.max(now_secs);
        if let Some(page) = draft.metadata.get("page_url").and_then(|v| v.as_str()) {
            self.current_page = page.to_string();
        }
        if let Some(agent) = client.user_agent.as_deref().filter(|a| !a.is_empty()) {
            self.user_agent = agent.to_string();
        }
        if let Some(ip) = client.ip_address.as_deref().filter(|a| !a.is_empty()) {
            self.ip_address = ip.to_string();
        }
    }
}
