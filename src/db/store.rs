//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::history::{AppendOutcome, HistoryStore, RetentionChange};
use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Invalid monitor: {0}")]
    InvalidMonitor(String),
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
    #[error("Database lock poisoned")]
    Poisoned,
}

struct Inner {
    conn: Connection,
    limit: RetentionLimit,
}

/// Thread-safe database store.
///
/// A single connection behind a mutex serializes every mutation, so each
/// history operation runs as one transaction that readers can never observe
/// half-applied.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
    floor: usize,
}

impl Store {
    /// Open (or create) a store at the given database path.
    pub fn open<P: AsRef<Path>>(path: P, config: HistoryConfig) -> Result<Self, DbError> {
        Self::with_connection(Connection::open(path)?, config)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory(config: HistoryConfig) -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: HistoryConfig) -> Result<Self, DbError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                limit: config.limit(),
            })),
            floor: config.retention_floor,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DbError> {
        self.inner.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Sites ---

    /// Insert a site or update its name and monitoring flag.
    pub fn upsert_site(&self, site: &Site) -> Result<(), DbError> {
        let inner = self.lock()?;
        inner.conn.execute(
            "INSERT INTO sites (identifier, name, monitoring) VALUES (?1, ?2, ?3)
             ON CONFLICT(identifier) DO UPDATE SET name=excluded.name, monitoring=excluded.monitoring",
            params![site.identifier, site.name(), site.monitoring],
        )?;
        Ok(())
    }

    /// Get a site by identifier.
    pub fn get_site(&self, identifier: &str) -> Result<Site, DbError> {
        let inner = self.lock()?;
        inner
            .conn
            .query_row(
                "SELECT identifier, name, monitoring FROM sites WHERE identifier = ?1",
                params![identifier],
                site_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)
    }

    /// Get all sites.
    pub fn get_sites(&self) -> Result<Vec<Site>, DbError> {
        let inner = self.lock()?;
        let mut stmt = inner
            .conn
            .prepare("SELECT identifier, name, monitoring FROM sites ORDER BY identifier")?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sites)
    }

    /// Delete a site together with its monitors and their history.
    ///
    /// Returns the ids of the removed monitors.
    pub fn delete_site(&self, identifier: &str) -> Result<Vec<MonitorId>, DbError> {
        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;

        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM monitors WHERE site_identifier = ?1")?;
            let ids = stmt
                .query_map(params![identifier], |row| row.get::<_, i64>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            ids
        };

        for id in &ids {
            tx.execute("DELETE FROM history WHERE monitor_id = ?1", params![id])?;
        }
        tx.execute("DELETE FROM monitors WHERE site_identifier = ?1", params![identifier])?;
        let deleted = tx.execute("DELETE FROM sites WHERE identifier = ?1", params![identifier])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }

        tx.commit()?;
        Ok(ids)
    }

    // --- Monitors ---

    /// Add a new monitor and return its ID.
    pub fn add_monitor(&self, monitor: &mut Monitor) -> Result<MonitorId, DbError> {
        monitor.validate().map_err(DbError::InvalidMonitor)?;

        let inner = self.lock()?;
        inner.conn.execute(
            "INSERT INTO monitors (site_identifier, kind, target, interval_ms, timeout_ms, retry_attempts, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                monitor.site_identifier,
                monitor.kind.as_str(),
                monitor.target,
                to_sql_int(monitor.interval_ms)?,
                to_sql_int(monitor.timeout_ms)?,
                monitor.retry_attempts,
                monitor.enabled,
            ],
        )?;
        let id = inner.conn.last_insert_rowid();
        monitor.id = id;
        Ok(id)
    }

    /// Update an existing monitor.
    pub fn update_monitor(&self, monitor: &Monitor) -> Result<(), DbError> {
        monitor.validate().map_err(DbError::InvalidMonitor)?;

        let inner = self.lock()?;
        let updated = inner.conn.execute(
            "UPDATE monitors SET site_identifier=?1, kind=?2, target=?3, interval_ms=?4, timeout_ms=?5,
             retry_attempts=?6, enabled=?7 WHERE id=?8",
            params![
                monitor.site_identifier,
                monitor.kind.as_str(),
                monitor.target,
                to_sql_int(monitor.interval_ms)?,
                to_sql_int(monitor.timeout_ms)?,
                monitor.retry_attempts,
                monitor.enabled,
                monitor.id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get a monitor by ID.
    pub fn get_monitor(&self, id: MonitorId) -> Result<Monitor, DbError> {
        let inner = self.lock()?;
        let row = inner
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", MONITOR_SELECT),
                params![id],
                MonitorRow::from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        row.into_monitor()
    }

    /// Get all monitors.
    pub fn get_monitors(&self) -> Result<Vec<Monitor>, DbError> {
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare(&format!("{} ORDER BY id", MONITOR_SELECT))?;
        let rows = stmt
            .query_map([], MonitorRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().map(MonitorRow::into_monitor).collect()
    }

    /// Get the monitors belonging to a site.
    pub fn get_site_monitors(&self, identifier: &str) -> Result<Vec<Monitor>, DbError> {
        let inner = self.lock()?;
        let mut stmt = inner
            .conn
            .prepare(&format!("{} WHERE site_identifier = ?1 ORDER BY id", MONITOR_SELECT))?;
        let rows = stmt
            .query_map(params![identifier], MonitorRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().map(MonitorRow::into_monitor).collect()
    }

    /// Delete a monitor and its history. Returns the number of history entries removed.
    pub fn delete_monitor(&self, id: MonitorId) -> Result<usize, DbError> {
        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;
        let removed = tx.execute("DELETE FROM history WHERE monitor_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        tx.commit()?;
        Ok(removed)
    }
}

impl HistoryStore for Store {
    fn append(&self, result: &CheckResult) -> Result<AppendOutcome, DbError> {
        let mut inner = self.lock()?;
        let limit = inner.limit;
        let tx = inner.conn.transaction()?;

        tx.execute(
            "INSERT INTO history (monitor_id, timestamp, status, response_time_ms, status_code, error_kind, error_detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.monitor_id,
                result.timestamp.format(TIME_FORMAT).to_string(),
                result.status.as_str(),
                result.response_time_ms,
                result.status_code,
                result.error_kind.map(|k| k.as_str()),
                result.error_detail,
            ],
        )?;
        let entry_id = tx.last_insert_rowid();
        let removed = prune_in(&tx, result.monitor_id, limit)?;

        tx.commit()?;
        Ok(AppendOutcome { entry_id, removed })
    }

    fn prune_to_limit(&self, monitor_id: MonitorId, limit: RetentionLimit) -> Result<usize, DbError> {
        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;
        let removed = prune_in(&tx, monitor_id, limit)?;
        tx.commit()?;
        Ok(removed)
    }

    fn delete_all(&self, monitor_id: MonitorId) -> Result<usize, DbError> {
        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;
        let removed = tx.execute("DELETE FROM history WHERE monitor_id = ?1", params![monitor_id])?;
        tx.commit()?;
        Ok(removed)
    }

    fn query(&self, monitor_id: MonitorId) -> Result<Vec<HistoryEntry>, DbError> {
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare(&format!(
            "{} WHERE monitor_id = ?1 ORDER BY id ASC",
            HISTORY_SELECT
        ))?;
        let rows = stmt
            .query_map(params![monitor_id], HistoryRow::from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        rows.into_iter().map(HistoryRow::into_entry).collect()
    }

    fn latest(&self, monitor_id: MonitorId) -> Result<Option<HistoryEntry>, DbError> {
        let inner = self.lock()?;
        let row = inner
            .conn
            .query_row(
                &format!("{} WHERE monitor_id = ?1 ORDER BY id DESC LIMIT 1", HISTORY_SELECT),
                params![monitor_id],
                HistoryRow::from_row,
            )
            .optional()?;
        row.map(HistoryRow::into_entry).transpose()
    }

    fn retention_limit(&self) -> Result<RetentionLimit, DbError> {
        Ok(self.lock()?.limit)
    }

    fn set_retention_limit(&self, requested: usize) -> Result<RetentionChange, DbError> {
        let limit = RetentionLimit::new(requested, self.floor);
        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;

        let monitor_ids = {
            let mut stmt = tx.prepare("SELECT DISTINCT monitor_id FROM history ORDER BY monitor_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            ids
        };

        let mut pruned = Vec::new();
        for monitor_id in monitor_ids {
            let removed = prune_in(&tx, monitor_id, limit)?;
            if removed > 0 {
                pruned.push((monitor_id, removed));
            }
        }

        tx.commit()?;
        inner.limit = limit;
        Ok(RetentionChange { limit, pruned })
    }
}

/// Delete the oldest entries of a monitor beyond `limit`, inside `tx`.
fn prune_in(tx: &Transaction<'_>, monitor_id: MonitorId, limit: RetentionLimit) -> Result<usize, DbError> {
    let removed = tx.execute(
        "DELETE FROM history WHERE monitor_id = ?1 AND id NOT IN (
             SELECT id FROM history WHERE monitor_id = ?1 ORDER BY id DESC LIMIT ?2
         )",
        params![monitor_id, to_sql_int(limit.get() as u64)?],
    )?;
    Ok(removed)
}

fn to_sql_int(value: u64) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|_| DbError::InvalidMonitor(format!("value {} out of range", value)))
}

fn from_sql_int(value: i64, column: &str) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::InvalidData(format!("negative {}: {}", column, value)))
}

fn site_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Site> {
    let identifier: String = row.get(0)?;
    let name: String = row.get(1)?;
    Ok(Site::new(identifier, Some(name.as_str()), row.get(2)?))
}

const MONITOR_SELECT: &str = "SELECT id, site_identifier, kind, target, interval_ms, timeout_ms, retry_attempts, enabled FROM monitors";

struct MonitorRow {
    id: i64,
    site_identifier: String,
    kind: String,
    target: String,
    interval_ms: i64,
    timeout_ms: i64,
    retry_attempts: u32,
    enabled: bool,
}

impl MonitorRow {
    fn from_row(row: &rusqlite::Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            site_identifier: row.get(1)?,
            kind: row.get(2)?,
            target: row.get(3)?,
            interval_ms: row.get(4)?,
            timeout_ms: row.get(5)?,
            retry_attempts: row.get(6)?,
            enabled: row.get(7)?,
        })
    }

    fn into_monitor(self) -> Result<Monitor, DbError> {
        Ok(Monitor {
            id: self.id,
            site_identifier: self.site_identifier,
            kind: self.kind.parse().map_err(DbError::InvalidData)?,
            target: self.target,
            interval_ms: from_sql_int(self.interval_ms, "interval_ms")?,
            timeout_ms: from_sql_int(self.timeout_ms, "timeout_ms")?,
            retry_attempts: self.retry_attempts,
            enabled: self.enabled,
        })
    }
}

const HISTORY_SELECT: &str = "SELECT id, monitor_id, timestamp, status, response_time_ms, status_code, error_kind, error_detail FROM history";

struct HistoryRow {
    id: i64,
    monitor_id: i64,
    timestamp: String,
    status: String,
    response_time_ms: i64,
    status_code: Option<u16>,
    error_kind: Option<String>,
    error_detail: Option<String>,
}

impl HistoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            monitor_id: row.get(1)?,
            timestamp: row.get(2)?,
            status: row.get(3)?,
            response_time_ms: row.get(4)?,
            status_code: row.get(5)?,
            error_kind: row.get(6)?,
            error_detail: row.get(7)?,
        })
    }

    /// Convert a raw row, rejecting values that do not decode cleanly.
    fn into_entry(self) -> Result<HistoryEntry, DbError> {
        let timestamp = parse_db_time(&self.timestamp).ok_or_else(|| {
            DbError::InvalidData(format!("history row {}: bad timestamp {:?}", self.id, self.timestamp))
        })?;
        let status: CheckStatus = self
            .status
            .parse()
            .map_err(|e| DbError::InvalidData(format!("history row {}: {}", self.id, e)))?;
        let error_kind = self
            .error_kind
            .map(|k| k.parse::<ErrorKind>())
            .transpose()
            .map_err(|e| DbError::InvalidData(format!("history row {}: {}", self.id, e)))?;
        if self.response_time_ms < UNMEASURED_MS {
            return Err(DbError::InvalidData(format!(
                "history row {}: response time {}",
                self.id, self.response_time_ms
            )));
        }

        Ok(HistoryEntry {
            id: self.id,
            result: CheckResult {
                monitor_id: self.monitor_id,
                timestamp,
                status,
                response_time_ms: self.response_time_ms,
                status_code: self.status_code,
                error_kind,
                error_detail: self.error_detail,
            },
        })
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
