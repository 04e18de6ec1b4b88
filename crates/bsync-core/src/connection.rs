//! Per-engine reachability: `Unknown → Connected → Degraded → Offline`.
//!
//! Health health and dispatch outcomes feed the same machine. A single
//! failure degrades an engine; the fifth consecutive failure takes it
//! offline and reports the transition exactly once. Any success resets
//! the error count and reconnects.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::constants::OFFLINE_ERROR_THRESHOLD;
use crate::engine::EngineId;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unknown,
    Connected,
    Degraded,
    Offline,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Offline => "offline",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(ConnectionState::Unknown),
            "connected" => Ok(ConnectionState::Connected),
            "degraded" => Ok(ConnectionState::Degraded),
            "offline" => Ok(ConnectionState::Offline),
            other => Err(SyncError::Validation(format!(
                "unknown connection state '{other}'"
            ))),
        }
    }
}

/// State change worth telling someone about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOffline,
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConnectionStatus {
    pub engine: EngineId,
    pub state: ConnectionState,
    /// Unix seconds of the last successful contact.
    pub last_ping: Option<u64>,
    /// Seconds taken by the last successful contact.
    pub response_time: f64,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl EngineConnectionStatus {
    pub fn new(engine: EngineId) -> Self {
        Self {
            engine,
            state: ConnectionState::Unknown,
            last_ping: None,
            response_time: 0.0,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Offline engines are skipped by the dispatcher until a health check succeeds.
    pub fn allows_dispatch(&self) -> bool {
        self.state != ConnectionState::Offline
    }

    pub fn record_success(&mut self, response_time: f64, now_secs: u64) -> Option<Transition> {
        let was_offline = self.state == ConnectionState::Offline;
        self.state = ConnectionState::Connected;
        self.last_ping = Some(now_secs);
        self.response_time = response_time;
        self.error_count = 0;
        self.last_error = None;
        was_offline.then_some(Transition::Recovered)
    }

    pub fn record_failure(&mut self, error: &str) -> Option<Transition> {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error.to_string());
        if self.error_count >= OFFLINE_ERROR_THRESHOLD {
            self.state = ConnectionState::Offline;
        } else {
            self.state = ConnectionState::Degraded;
        }
        (self.error_count == OFFLINE_ERROR_THRESHOLD).then_some(Transition::WentOffline)
    }
}

/// One status row per engine, keyed in rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionTable {
    rows: BTreeMap<EngineId, EngineConnectionStatus>,
}

impl ConnectionTable {
    pub fn new(engines: impl IntoIterator<Item = EngineId>) -> Self {
        let rows = engines
            .into_iter()
            .map(|id| (id, EngineConnectionStatus::new(id)))
            .collect();
        Self { rows }
    }

    /// Overwrite rows with previously persisted statuses.
    pub fn restore(&mut self, statuses: impl IntoIterator<Item = EngineConnectionStatus>) {
        for status in statuses {
            if let Some(row) = self.rows.get_mut(&status.engine) {
                *row = status;
            }
        }
    }

    pub fn get(&self, engine: EngineId) -> Option<&EngineConnectionStatus> {
        self.rows.get(&engine)
    }

    /// Unknown engines (not in the table) are never dispatched to.
    pub fn allows_dispatch(&self, engine: EngineId) -> bool {
        self.rows
            .get(&engine)
            .is_some_and(EngineConnectionStatus::allows_dispatch)
    }

    pub fn record_success(
        &mut self,
        engine: EngineId,
        response_time: f64,
        now_secs: u64,
    ) -> Option<Transition> {
        self.rows
            .get_mut(&engine)
            .and_then(|row| row.record_success(response_time, now_secs))
    }

    pub fn record_failure(&mut self, engine: EngineId, error: &str) -> Option<Transition> {
        self.rows
            .get_mut(&engine)
            .and_then(|row| row.record_failure(error))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineConnectionStatus> {
        self.rows.values()
    }

    /// Compact per-engine view used in API responses.
    pub fn summary(&self) -> BTreeMap<EngineId, StatusSummary> {
        self.rows
            .iter()
            .map(|(id, row)| {
                (
                    *id,
                    StatusSummary {
                        connected: row.is_connected(),
                        state: row.state,
                        response_time: row.response_time,
                        error_count: row.error_count,
                        last_error: row.last_error.clone(),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub connected: bool,
    pub state: ConnectionState,
    pub response_time: f64,
    pub error_count: u32,
    pub last_error: Option<String>,
}
