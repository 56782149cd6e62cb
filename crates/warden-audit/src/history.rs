//! Audit and spawn history
//!
//! Provides:
//! - [`AuditHistory`]: persisted audit results, used for adaptive timeouts
//! - [`SpawnHistory`]: worker spawn attempts, read by diagnostics
//! - [`DatabaseProbe`]: connectivity and latency of the backing database
//! - [`SqliteAuditStore`] implementing all three over one SQLite file
//! - [`InMemoryAuditHistory`] for tests and persistence-free deployments
//!
//! Timestamps are stored as RFC 3339 UTC strings with millisecond precision,
//! which sort lexicographically.

use crate::error::HistoryError;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use warden_core::{AuditResult, AuditStatus, AuditType};

/// One worker spawn attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpawnRecord {
    /// Worker identity spawned
    pub worker: String,
    /// When the attempt began
    pub started_at: DateTime<Utc>,
    /// The worker came up
    pub success: bool,
    /// Time to a running worker; `None` when the attempt was not timed
    pub spawn_ms: Option<u64>,
}

/// Database health snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatabaseHealth {
    /// The health query succeeded
    pub connected: bool,
    /// Round trip of the health query
    pub latency_ms: Option<u64>,
    /// Connections in use, where the backend can tell
    pub active_connections: Option<u32>,
    /// Connection budget the active count is compared against
    pub max_connections: Option<u32>,
    /// The health query itself exceeded the slow threshold
    ///
    /// SQLite has no view of other running queries, so this is the only
    /// slowness signal available.
    pub slow_round_trip: bool,
    /// Why the database is unreachable
    pub error: Option<String>,
}

impl DatabaseHealth {
    /// Active/max connection ratio
    #[must_use]
    pub fn connection_ratio(&self) -> Option<f64> {
        let active = self.active_connections?;
        let max = self.max_connections.filter(|m| *m > 0)?;
        Some(f64::from(active) / f64::from(max))
    }

    /// Snapshot of an unreachable database
    #[must_use]
    pub fn disconnected(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Persisted audit results
#[async_trait::async_trait]
pub trait AuditHistory: Send + Sync {
    /// Append a result
    async fn record(&self, result: &AuditResult) -> Result<(), HistoryError>;

    /// Mean duration in minutes of non-failing audits of `audit_type` since `since`
    async fn average_duration(
        &self,
        audit_type: &AuditType,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, HistoryError>;

    /// Most recent results, newest first
    async fn recent(&self, audit_type: &AuditType, limit: usize) -> Result<Vec<AuditResult>, HistoryError>;
}

/// Worker spawn attempts
#[async_trait::async_trait]
pub trait SpawnHistory: Send + Sync {
    /// Attempts since `since`; `Ok(None)` when spawn history is not kept
    async fn spawns_since(&self, since: DateTime<Utc>) -> Result<Option<Vec<SpawnRecord>>, HistoryError>;
}

/// Database connectivity probe
#[async_trait::async_trait]
pub trait DatabaseProbe: Send + Sync {
    /// Take a snapshot; never fails, degrades to a disconnected snapshot
    async fn probe(&self) -> DatabaseHealth;
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HistoryError::Corrupt(format!("timestamp {text}: {e}")))
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_results (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_type         TEXT    NOT NULL,
    timestamp          TEXT    NOT NULL,
    duration_minutes   REAL    NOT NULL,
    overall_status     TEXT    NOT NULL,
    deployment_blocked INTEGER NOT NULL,
    block_reasons      TEXT    NOT NULL,
    recommendations    TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_results_type_time
    ON audit_results (audit_type, timestamp);
";

const SPAWN_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agent_spawn_history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    worker     TEXT    NOT NULL,
    started_at TEXT    NOT NULL,
    success    INTEGER NOT NULL,
    spawn_ms   INTEGER
);
CREATE INDEX IF NOT EXISTS idx_agent_spawn_history_time
    ON agent_spawn_history (started_at);
";

/// SQLite-backed history
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
    max_connections: u32,
    slow_round_trip: Duration,
}

impl SqliteAuditStore {
    /// Open (creating if needed) the database at `path`
    ///
    /// # Errors
    /// - `HistoryError::Io` if the parent directory cannot be created
    /// - `HistoryError::Sqlite` if the database cannot be opened or migrated
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    /// - `HistoryError::Sqlite` if the schema cannot be created
    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_connections: 20,
            slow_round_trip: Duration::from_secs(10),
        })
    }

    /// With connection budget reported by the probe
    #[inline]
    #[must_use]
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// With the health-query latency above which the database counts as slow
    #[inline]
    #[must_use]
    pub fn with_slow_round_trip(mut self, threshold: Duration) -> Self {
        self.slow_round_trip = threshold;
        self
    }

    /// Create the optional spawn history table
    ///
    /// # Errors
    /// - `HistoryError::Sqlite` on schema failure
    pub async fn enable_spawn_history(&self) -> Result<(), HistoryError> {
        self.conn.lock().await.execute_batch(SPAWN_SCHEMA)?;
        Ok(())
    }

    /// Append a spawn attempt
    ///
    /// # Errors
    /// - `HistoryError::Sqlite` if the table is missing or the insert fails
    pub async fn record_spawn(&self, record: &SpawnRecord) -> Result<(), HistoryError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_spawn_history (worker, started_at, success, spawn_ms) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.worker,
                ts(record.started_at),
                record.success,
                record.spawn_ms.and_then(|ms| i64::try_from(ms).ok())
            ],
        )?;
        Ok(())
    }

    /// Delete audit results older than `before`; returns rows removed
    ///
    /// # Errors
    /// - `HistoryError::Sqlite` on failure
    pub async fn prune(&self, before: DateTime<Utc>) -> Result<usize, HistoryError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM audit_results WHERE timestamp < ?1", params![ts(before)])?;
        if removed > 0 {
            tracing::info!(removed, "Pruned audit history");
        }
        Ok(removed)
    }

    fn has_table(conn: &Connection, name: &str) -> Result<bool, HistoryError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, f64, String, bool, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }
}

#[async_trait::async_trait]
impl AuditHistory for SqliteAuditStore {
    async fn record(&self, result: &AuditResult) -> Result<(), HistoryError> {
        let block_reasons = serde_json::to_string(&result.block_reasons)
            .map_err(|e| HistoryError::Corrupt(e.to_string()))?;
        let recommendations = serde_json::to_string(&result.recommendations)
            .map_err(|e| HistoryError::Corrupt(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_results
                (audit_type, timestamp, duration_minutes, overall_status, deployment_blocked, block_reasons, recommendations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.audit_type.as_str(),
                ts(result.timestamp),
                result.duration_minutes,
                result.overall_status.as_str(),
                result.deployment_blocked,
                block_reasons,
                recommendations,
            ],
        )?;
        Ok(())
    }

    async fn average_duration(
        &self,
        audit_type: &AuditType,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, HistoryError> {
        let conn = self.conn.lock().await;
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(duration_minutes) FROM audit_results
             WHERE audit_type = ?1 AND timestamp >= ?2 AND overall_status != 'FAIL'",
            params![audit_type.as_str(), ts(since)],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    async fn recent(&self, audit_type: &AuditType, limit: usize) -> Result<Vec<AuditResult>, HistoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT audit_type, timestamp, duration_minutes, overall_status, deployment_blocked, block_reasons, recommendations
             FROM audit_results WHERE audit_type = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![audit_type.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
            Self::row_to_result,
        )?;

        let mut results = Vec::new();
        for row in rows {
            let (kind, timestamp, duration, status, blocked, reasons, recs) = row?;
            results.push(AuditResult {
                audit_type: AuditType::new(kind),
                timestamp: parse_ts(&timestamp)?,
                duration_minutes: duration,
                overall_status: status.parse::<AuditStatus>().map_err(HistoryError::Corrupt)?,
                deployment_blocked: blocked,
                block_reasons: serde_json::from_str(&reasons).map_err(|e| HistoryError::Corrupt(e.to_string()))?,
                recommendations: serde_json::from_str(&recs).map_err(|e| HistoryError::Corrupt(e.to_string()))?,
            });
        }
        Ok(results)
    }
}

#[async_trait::async_trait]
impl SpawnHistory for SqliteAuditStore {
    async fn spawns_since(&self, since: DateTime<Utc>) -> Result<Option<Vec<SpawnRecord>>, HistoryError> {
        let conn = self.conn.lock().await;
        if !Self::has_table(&conn, "agent_spawn_history")? {
            return Ok(None);
        }
        let mut stmt = conn.prepare(
            "SELECT worker, started_at, success, spawn_ms FROM agent_spawn_history
             WHERE started_at >= ?1 ORDER BY started_at",
        )?;
        let rows = stmt.query_map(params![ts(since)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (worker, started_at, success, spawn_ms) = row?;
            records.push(SpawnRecord {
                worker,
                started_at: parse_ts(&started_at)?,
                success,
                spawn_ms: spawn_ms.and_then(|ms| u64::try_from(ms).ok()),
            });
        }
        Ok(Some(records))
    }
}

#[async_trait::async_trait]
impl DatabaseProbe for SqliteAuditStore {
    async fn probe(&self) -> DatabaseHealth {
        let start = Instant::now();
        let conn = self.conn.lock().await;
        match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => {
                let elapsed = start.elapsed();
                DatabaseHealth {
                    connected: true,
                    latency_ms: Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
                    active_connections: Some(1),
                    max_connections: Some(self.max_connections),
                    slow_round_trip: elapsed > self.slow_round_trip,
                    error: None,
                }
            }
            Err(e) => DatabaseHealth::disconnected(e.to_string()),
        }
    }
}

/// History kept in memory
#[derive(Debug, Default)]
pub struct InMemoryAuditHistory {
    results: SyncMutex<Vec<AuditResult>>,
    spawns: SyncMutex<Option<Vec<SpawnRecord>>>,
}

impl InMemoryAuditHistory {
    /// Create empty history without spawn tracking
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With spawn records
    #[must_use]
    pub fn with_spawns(self, spawns: Vec<SpawnRecord>) -> Self {
        *self.spawns.lock() = Some(spawns);
        self
    }

    /// Every recorded result, oldest first
    #[must_use]
    pub fn results(&self) -> Vec<AuditResult> {
        self.results.lock().clone()
    }
}

#[async_trait::async_trait]
impl AuditHistory for InMemoryAuditHistory {
    async fn record(&self, result: &AuditResult) -> Result<(), HistoryError> {
        self.results.lock().push(result.clone());
        Ok(())
    }

    async fn average_duration(
        &self,
        audit_type: &AuditType,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, HistoryError> {
        let results = self.results.lock();
        let durations: Vec<f64> = results
            .iter()
            .filter(|r| &r.audit_type == audit_type && r.timestamp >= since)
            .filter(|r| r.overall_status != AuditStatus::Fail)
            .map(|r| r.duration_minutes)
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }
        Ok(Some(durations.iter().sum::<f64>() / durations.len() as f64))
    }

    async fn recent(&self, audit_type: &AuditType, limit: usize) -> Result<Vec<AuditResult>, HistoryError> {
        let results = self.results.lock();
        let mut matching: Vec<_> = results.iter().filter(|r| &r.audit_type == audit_type).cloned().collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait::async_trait]
impl SpawnHistory for InMemoryAuditHistory {
    async fn spawns_since(&self, since: DateTime<Utc>) -> Result<Option<Vec<SpawnRecord>>, HistoryError> {
        Ok(self
            .spawns
            .lock()
            .as_ref()
            .map(|s| s.iter().filter(|r| r.started_at >= since).cloned().collect()))
    }
}

#[async_trait::async_trait]
impl DatabaseProbe for InMemoryAuditHistory {
    async fn probe(&self) -> DatabaseHealth {
        DatabaseHealth {
            connected: true,
            latency_ms: Some(0),
            ..DatabaseHealth::default()
        }
    }
}
