use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 2;

pub fn initialize(conn: &Connection) -> Result<()> {
    // WAL lets the event stream read while the dispatcher writes.
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    // Wait up to 5s on a locked database instead of failing at once.
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every 100 pages (~400KB) so the WAL stays small.
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Fold WAL left over from the last run into the main file and
    // truncate it. In-memory and fresh databases refuse this; not fatal.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS behavior_queue (
            seq            INTEGER PRIMARY KEY AUTOINCREMENT,
            id             TEXT NOT NULL UNIQUE,
            user_id        INTEGER NOT NULL,
            action         TEXT NOT NULL,
            object_id      INTEGER NOT NULL DEFAULT 0,
            metadata       TEXT NOT NULL DEFAULT '{}',
            ai_targets     TEXT NOT NULL,
            metric_impacts TEXT NOT NULL DEFAULT '{}',
            priority       INTEGER NOT NULL DEFAULT 5,
            status         TEXT NOT NULL DEFAULT 'pending',
            attempts       INTEGER NOT NULL DEFAULT 0,
            queued_at      INTEGER NOT NULL,
            created_at     TEXT NOT NULL,
            processed_at   TEXT,
            last_error     TEXT
        );

        CREATE TABLE IF NOT EXISTS ai_insights (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id          INTEGER NOT NULL,
            ai_engine        TEXT NOT NULL,
            event_id         TEXT,
            insights_data    TEXT NOT NULL,
            confidence_score REAL NOT NULL DEFAULT 0.5,
            processing_time  REAL NOT NULL DEFAULT 0,
            response_time    REAL NOT NULL DEFAULT 0,
            created_at       INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS connection_status (
            engine        TEXT PRIMARY KEY,
            state         TEXT NOT NULL,
            last_ping     INTEGER,
            response_time REAL NOT NULL DEFAULT 0,
            error_count   INTEGER NOT NULL DEFAULT 0,
            last_error    TEXT,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_metrics (
            user_id    INTEGER NOT NULL,
            metric     TEXT NOT NULL,
            value      REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, metric)
        );

        CREATE TABLE IF NOT EXISTS user_profiles (
            user_id              INTEGER PRIMARY KEY,
            subscription_plan    TEXT,
            completed_milestones TEXT NOT NULL DEFAULT '[]',
            updated_at           TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_queue_status_priority
            ON behavior_queue(status, priority DESC, queued_at ASC);
        CREATE INDEX IF NOT EXISTS idx_queue_user ON behavior_queue(user_id);
        CREATE INDEX IF NOT EXISTS idx_insights_user ON ai_insights(user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_insights_engine ON ai_insights(ai_engine);
        ",
    )?;

    // v1 databases predate the insight response_time column.
    if conn
        .prepare("SELECT response_time FROM ai_insights LIMIT 0")
        .is_err()
    {
        conn.execute_batch(
            "ALTER TABLE ai_insights ADD COLUMN response_time REAL NOT NULL DEFAULT 0;",
        )?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        for table in &[
            "metadata",
            "behavior_queue",
            "ai_insights",
            "connection_status",
            "user_metrics",
            "user_profiles",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert!(count >= 0, "table {table} should exist");
        }
    }

    #[test]
    fn test_schema_version_set() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_idempotent_initialize() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
    }

    #[test]
    fn test_busy_timeout_set() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn test_adds_response_time_to_old_insights_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE ai_insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                ai_engine TEXT NOT NULL,
                event_id TEXT,
                insights_data TEXT NOT NULL,
                confidence_score REAL NOT NULL DEFAULT 0.5,
                processing_time REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );",
        )
        .unwrap();
        initialize(&conn).unwrap();
        conn.prepare("SELECT response_time FROM ai_insights LIMIT 0")
            .unwrap();
    }
}
