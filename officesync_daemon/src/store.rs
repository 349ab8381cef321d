//! Append-only metrics store on SQLite: agent samples, system samples and the
//! event log. Rows are only ever inserted; nothing here updates or deletes.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Row};
use tokio_rusqlite::Connection;

use crate::error::StoreError;
use crate::metrics::{AgentMetricsSample, EventRecord, SystemMetricsSample};

pub struct MetricsStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers: timestamps as fixed-width RFC 3339 text so string order is time order
// ---------------------------------------------------------------------------

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn uint(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    Ok(u64::try_from(v).unwrap_or(0))
}

const AGENT_COLUMNS: &str = "agent_id, timestamp, tasks_completed, tasks_failed, tasks_in_progress, \
     avg_task_duration, total_work_time, idle_time, messages_sent, messages_received, \
     error_rate, success_rate";

const SYSTEM_COLUMNS: &str = "timestamp, total_agents, active_agents, idle_agents, busy_agents, \
     offline_agents, total_tasks_completed, total_tasks_failed, total_tasks_pending, \
     health_score, events_per_minute";

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentMetricsSample> {
    Ok(AgentMetricsSample {
        agent_id: row.get(0)?,
        timestamp: ts_from_sql(row, 1)?,
        tasks_completed: uint(row, 2)?,
        tasks_failed: uint(row, 3)?,
        tasks_in_progress: uint(row, 4)?,
        avg_task_duration: row.get(5)?,
        total_work_time: row.get(6)?,
        idle_time: row.get(7)?,
        messages_sent: uint(row, 8)?,
        messages_received: uint(row, 9)?,
        error_rate: row.get(10)?,
        success_rate: row.get(11)?,
    })
}

fn system_from_row(row: &Row<'_>) -> rusqlite::Result<SystemMetricsSample> {
    Ok(SystemMetricsSample {
        timestamp: ts_from_sql(row, 0)?,
        total_agents: uint(row, 1)?,
        active_agents: uint(row, 2)?,
        idle_agents: uint(row, 3)?,
        busy_agents: uint(row, 4)?,
        offline_agents: uint(row, 5)?,
        total_tasks_completed: uint(row, 6)?,
        total_tasks_failed: uint(row, 7)?,
        total_tasks_pending: uint(row, 8)?,
        health_score: row.get(9)?,
        events_per_minute: row.get(10)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let payload: Option<String> = row.get(3)?;
    let payload = payload
        .map(|p| serde_json::from_str(&p))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(EventRecord {
        timestamp: ts_from_sql(row, 0)?,
        event_type: row.get(1)?,
        agent_id: row.get(2)?,
        payload,
    })
}

impl MetricsStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS agent_metrics (
                        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                        agent_id           TEXT NOT NULL,
                        timestamp          TEXT NOT NULL,
                        tasks_completed    INTEGER NOT NULL DEFAULT 0,
                        tasks_failed       INTEGER NOT NULL DEFAULT 0,
                        tasks_in_progress  INTEGER NOT NULL DEFAULT 0,
                        avg_task_duration  REAL NOT NULL DEFAULT 0,
                        total_work_time    REAL NOT NULL DEFAULT 0,
                        idle_time          REAL NOT NULL DEFAULT 0,
                        messages_sent      INTEGER NOT NULL DEFAULT 0,
                        messages_received  INTEGER NOT NULL DEFAULT 0,
                        error_rate         REAL NOT NULL DEFAULT 0,
                        success_rate       REAL NOT NULL DEFAULT 1
                    );

                    CREATE TABLE IF NOT EXISTS system_metrics (
                        id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp              TEXT NOT NULL,
                        total_agents           INTEGER NOT NULL DEFAULT 0,
                        active_agents          INTEGER NOT NULL DEFAULT 0,
                        idle_agents            INTEGER NOT NULL DEFAULT 0,
                        busy_agents            INTEGER NOT NULL DEFAULT 0,
                        offline_agents         INTEGER NOT NULL DEFAULT 0,
                        total_tasks_completed  INTEGER NOT NULL DEFAULT 0,
                        total_tasks_failed     INTEGER NOT NULL DEFAULT 0,
                        total_tasks_pending    INTEGER NOT NULL DEFAULT 0,
                        health_score           REAL NOT NULL DEFAULT 1,
                        events_per_minute      REAL NOT NULL DEFAULT 0
                    );

                    CREATE TABLE IF NOT EXISTS events (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp   TEXT NOT NULL,
                        event_type  TEXT NOT NULL,
                        agent_id    TEXT,
                        payload     TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_agent_metrics_agent ON agent_metrics(agent_id, timestamp);
                    CREATE INDEX IF NOT EXISTS idx_system_metrics_time ON system_metrics(timestamp);
                    CREATE INDEX IF NOT EXISTS idx_events_type         ON events(event_type);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Appends
    // -----------------------------------------------------------------------

    pub async fn insert_agent_samples(&self, samples: &[AgentMetricsSample]) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        let samples = samples.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(&format!(
                        "INSERT INTO agent_metrics ({AGENT_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                    ))?;
                    for s in &samples {
                        stmt.execute(params![
                            s.agent_id,
                            ts_to_sql(&s.timestamp),
                            int(s.tasks_completed),
                            int(s.tasks_failed),
                            int(s.tasks_in_progress),
                            s.avg_task_duration,
                            s.total_work_time,
                            s.idle_time,
                            int(s.messages_sent),
                            int(s.messages_received),
                            s.error_rate,
                            s.success_rate,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn insert_system_sample(&self, s: &SystemMetricsSample) -> Result<(), StoreError> {
        let s = s.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO system_metrics ({SYSTEM_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                    ),
                    params![
                        ts_to_sql(&s.timestamp),
                        int(s.total_agents),
                        int(s.active_agents),
                        int(s.idle_agents),
                        int(s.busy_agents),
                        int(s.offline_agents),
                        int(s.total_tasks_completed),
                        int(s.total_tasks_failed),
                        int(s.total_tasks_pending),
                        s.health_score,
                        s.events_per_minute,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Append events in the order given.
    pub async fn insert_events(&self, events: &[EventRecord]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let rows = events
            .iter()
            .map(|e| {
                let payload = e.payload.as_ref().map(serde_json::to_string).transpose()?;
                Ok((ts_to_sql(&e.timestamp), e.event_type.clone(), e.agent_id.clone(), payload))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO events (timestamp, event_type, agent_id, payload) \
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (ts, kind, agent, payload) in &rows {
                        stmt.execute(params![ts, kind, agent, payload])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Samples for one agent newer than `since`, oldest first.
    pub async fn agent_history(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AgentMetricsSample>, StoreError> {
        let agent_id = agent_id.to_string();
        let since = ts_to_sql(&since);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agent_metrics \
                     WHERE agent_id = ?1 AND timestamp > ?2 ORDER BY timestamp ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map(params![agent_id, since], agent_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// System samples newer than `since`, oldest first.
    pub async fn system_history(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemMetricsSample>, StoreError> {
        let since = ts_to_sql(&since);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {SYSTEM_COLUMNS} FROM system_metrics \
                     WHERE timestamp > ?1 ORDER BY timestamp ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map(params![since], system_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Most recent events first, optionally of a single type.
    pub async fn recent_events(
        &self,
        event_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let event_type = event_type.map(str::to_string);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT timestamp, event_type, agent_id, payload FROM events \
                     WHERE (?1 IS NULL OR event_type = ?1) \
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![event_type, limit], event_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}
