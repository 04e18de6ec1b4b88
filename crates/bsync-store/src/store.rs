use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bsync_core::time::now_iso8601;
use bsync_core::{
    BehaviorAction, BehaviorEvent, ConnectionState, DeliveryState, EngineConnectionStatus,
    EngineId, Insight, MAX_ATTEMPTS, MetricTotals, StoredEvent,
};

use crate::error::{Result, StoreError};
use crate::schema;

/// Row counts of the persisted queue by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

/// A persisted behavior row as published on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRow {
    pub seq: i64,
    pub id: Uuid,
    pub user_id: u64,
    pub action: String,
    pub object_id: u64,
    pub priority: u8,
    pub status: String,
    pub attempts: u32,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: u64,
    pub subscription_plan: Option<String>,
    #[serde(default)]
    pub completed_milestones: Vec<String>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Behavior queue ---

    /// Persist a freshly queued event. Returns its row sequence number.
    pub fn insert_event(&self, event: &BehaviorEvent) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO behavior_queue
                (id, user_id, action, object_id, metadata, ai_targets, metric_impacts,
                 priority, status, attempts, queued_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                event.id().to_string(),
                event.user_id() as i64,
                event.action().as_str(),
                event.object_id() as i64,
                serde_json::to_string(event.metadata())?,
                serde_json::to_string(event.target_engines())?,
                serde_json::to_string(event.metric_impacts())?,
                event.priority(),
                event.state().as_str(),
                event.attempts(),
                event.queued_at() as i64,
                now_iso8601(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn mark_processed(&self, id: Uuid) -> Result<()> {
        self.update_status(
            "UPDATE behavior_queue SET status = 'processed', processed_at = ?2, last_error = NULL
             WHERE id = ?1",
            params![id.to_string(), now_iso8601()],
            id,
        )
    }

    /// Record a failed round that left the event pending.
    pub fn record_attempt(&self, id: Uuid, attempts: u32, error: &str) -> Result<()> {
        self.update_status(
            "UPDATE behavior_queue SET attempts = ?2, last_error = ?3 WHERE id = ?1",
            params![id.to_string(), attempts, error],
            id,
        )
    }

    pub fn mark_failed(&self, id: Uuid, attempts: u32, error: &str) -> Result<()> {
        self.update_status(
            "UPDATE behavior_queue SET status = 'failed', attempts = ?2, last_error = ?3,
                    processed_at = ?4
             WHERE id = ?1",
            params![id.to_string(), attempts, error, now_iso8601()],
            id,
        )
    }

    fn update_status(&self, sql: &str, params: impl rusqlite::Params, id: Uuid) -> Result<()> {
        let rows = self.conn.execute(sql, params)?;
        if rows == 0 {
            return Err(StoreError::InvalidData(format!("event not found: {id}")));
        }
        Ok(())
    }

    /// Pending rows with retry budget left, in dispatch order, skipping
    /// ids in `exclude`.
    pub fn load_pending(
        &self,
        limit: usize,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<BehaviorEvent>> {
        let fetch = limit.saturating_add(exclude.len()) as i64;
        let mut stmt = self.conn.prepare(
            "SELECT id, action, user_id, object_id, metadata, ai_targets, metric_impacts,
                    priority, attempts, queued_at
             FROM behavior_queue
             WHERE status = 'pending' AND attempts < ?1
             ORDER BY priority DESC, queued_at ASC, seq ASC
             LIMIT ?2",
        )?;

        let rows: Vec<PendingRow> = stmt
            .query_map(params![MAX_ATTEMPTS, fetch], |row| {
                Ok(PendingRow {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    user_id: row.get(2)?,
                    object_id: row.get(3)?,
                    metadata: row.get(4)?,
                    targets: row.get(5)?,
                    impacts: row.get(6)?,
                    priority: row.get(7)?,
                    attempts: row.get(8)?,
                    queued_at: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut events = Vec::with_capacity(limit.min(rows.len()));
        for row in rows {
            if events.len() >= limit {
                break;
            }
            let id = parse_uuid(&row.id)?;
            if exclude.contains(&id) {
                continue;
            }
            events.push(BehaviorEvent::restore(row.into_stored(id)?));
        }
        Ok(events)
    }

    /// Rows inserted after `after_seq`, oldest first.
    pub fn recent_events(&self, after_seq: i64, limit: usize) -> Result<Vec<StreamRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, id, user_id, action, object_id, priority, status, attempts, created_at
             FROM behavior_queue WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;

        stmt.query_map(params![after_seq, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, u8>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?
        .map(|r| {
            let (seq, id, user_id, action, object_id, priority, status, attempts, created_at) = r?;
            Ok(StreamRow {
                seq,
                id: parse_uuid(&id)?,
                user_id: user_id as u64,
                action,
                object_id: object_id as u64,
                priority,
                status,
                attempts,
                created_at,
            })
        })
        .collect()
    }

    pub fn queue_counts(&self) -> Result<QueueCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM behavior_queue GROUP BY status")?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;

        let mut counts = QueueCounts::default();
        for (status, n) in rows {
            let n = n as u64;
            match status.as_str() {
                "pending" => counts.pending = n,
                "processed" => counts.processed = n,
                "failed" => counts.failed = n,
                other => tracing::warn!("unexpected queue status '{other}' ({n} rows)"),
            }
        }
        Ok(counts)
    }

    // --- Insights ---

    pub fn insert_insight(&self, insight: &Insight) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO ai_insights
                (user_id, ai_engine, event_id, insights_data, confidence_score,
                 processing_time, response_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                insight.user_id as i64,
                insight.engine.as_str(),
                insight.event_id.map(|id| id.to_string()),
                serde_json::to_string(&insight.payload)?,
                insight.confidence,
                insight.processing_time,
                insight.response_time,
                insight.created_at as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent insights for a user, newest first.
    pub fn insights_for_user(&self, user_id: u64, limit: usize) -> Result<Vec<Insight>> {
        let mut stmt = self.conn.prepare(
            "SELECT ai_engine, event_id, insights_data, confidence_score, processing_time,
                    response_time, created_at
             FROM ai_insights WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;

        stmt.query_map(params![user_id as i64, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?
        .map(|r| {
            let (
                engine,
                event_id,
                payload,
                confidence,
                processing_time,
                response_time,
                created_at,
            ) = r?;
            Ok(Insight {
                user_id,
                engine: parse_engine(&engine)?,
                event_id: event_id.as_deref().map(parse_uuid).transpose()?,
                payload: serde_json::from_str(&payload)?,
                confidence,
                processing_time,
                response_time,
                created_at: created_at as u64,
            })
        })
        .collect()
    }

    // --- Connection status ---

    pub fn save_connection(&self, status: &EngineConnectionStatus) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO connection_status
                (engine, state, last_ping, response_time, error_count, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                status.engine.as_str(),
                status.state.as_str(),
                status.last_ping.map(|t| t as i64),
                status.response_time,
                status.error_count,
                status.last_error,
                now_iso8601(),
            ],
        )?;
        Ok(())
    }

    /// Every persisted status row. Rows naming unknown engines are skipped.
    pub fn load_connections(&self) -> Result<Vec<EngineConnectionStatus>> {
        let mut stmt = self.conn.prepare(
            "SELECT engine, state, last_ping, response_time, error_count, last_error
             FROM connection_status ORDER BY engine",
        )?;
        let rows: Vec<(String, String, Option<i64>, f64, u32, Option<String>)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut statuses = Vec::with_capacity(rows.len());
        for (engine, state, last_ping, response_time, error_count, last_error) in rows {
            let Ok(engine) = engine.parse::<EngineId>() else {
                tracing::warn!("ignoring status row for unknown engine '{engine}'");
                continue;
            };
            let state = state
                .parse::<ConnectionState>()
                .map_err(|e| StoreError::InvalidData(e.to_string()))?;
            statuses.push(EngineConnectionStatus {
                engine,
                state,
                last_ping: last_ping.map(|t| t as u64),
                response_time,
                error_count,
                last_error,
            });
        }
        Ok(statuses)
    }

    // --- User metrics ---

    /// Add each delta to the user's running total in one transaction.
    pub fn apply_metric_deltas(&self, user_id: u64, deltas: &BTreeMap<String, f64>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO user_metrics (user_id, metric, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, metric)
                 DO UPDATE SET value = value + excluded.value, updated_at = excluded.updated_at",
            )?;
            let now = now_iso8601();
            for (metric, delta) in deltas {
                if !delta.is_finite() {
                    continue;
                }
                stmt.execute(params![user_id as i64, metric, delta, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn user_metrics(&self, user_id: u64) -> Result<MetricTotals> {
        let mut stmt = self
            .conn
            .prepare("SELECT metric, value FROM user_metrics WHERE user_id = ?1 ORDER BY metric")?;
        stmt.query_map([user_id as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
            .collect::<std::result::Result<MetricTotals, _>>()
            .map_err(StoreError::from)
    }

    // --- User profiles ---

    pub fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO user_profiles
                (user_id, subscription_plan, completed_milestones, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                profile.user_id as i64,
                profile.subscription_plan,
                serde_json::to_string(&profile.completed_milestones)?,
                now_iso8601(),
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: u64) -> Result<Option<UserProfile>> {
        let row: Option<(Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT subscription_plan, completed_milestones FROM user_profiles WHERE user_id = ?1",
                [user_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(subscription_plan, milestones)| -> Result<UserProfile> {
            Ok(UserProfile {
                user_id,
                subscription_plan,
                completed_milestones: serde_json::from_str(&milestones)?,
            })
        })
        .transpose()
    }
}

struct PendingRow {
    id: String,
    action: String,
    user_id: i64,
    object_id: i64,
    metadata: String,
    targets: String,
    impacts: String,
    priority: u8,
    attempts: u32,
    queued_at: i64,
}

impl PendingRow {
    fn into_stored(self, id: Uuid) -> Result<StoredEvent> {
        let action = self
            .action
            .parse::<BehaviorAction>()
            .map_err(|e: bsync_core::SyncError| StoreError::InvalidData(e.to_string()))?;
        let target_engines: BTreeSet<EngineId> = serde_json::from_str(&self.targets)?;
        Ok(StoredEvent {
            id,
            action,
            user_id: self.user_id as u64,
            object_id: self.object_id as u64,
            metadata: serde_json::from_str(&self.metadata)?,
            target_engines,
            metric_impacts: serde_json::from_str(&self.impacts)?,
            priority: self.priority,
            queued_at: self.queued_at as u64,
            state: DeliveryState::Pending {
                attempts: self.attempts,
            },
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}

fn parse_engine(s: &str) -> Result<EngineId> {
    s.parse::<EngineId>()
        .map_err(|e: bsync_core::SyncError| StoreError::InvalidData(e.to_string()))
}
