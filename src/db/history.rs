//! Storage contract for per-monitor check history.

use super::models::{CheckResult, HistoryEntry, MonitorId, RetentionLimit};
use super::store::DbError;

/// Result of appending a check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub entry_id: i64,
    /// Entries pruned in the same transaction as the insert
    pub removed: usize,
}

/// Result of changing the retention limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionChange {
    pub limit: RetentionLimit,
    /// Monitors that lost entries, with the number removed
    pub pruned: Vec<(MonitorId, usize)>,
}

/// Ordered, size-bounded history of check results per monitor.
///
/// Every mutation is atomic: readers see the history either before or after
/// an `append` (including its pruning), never in between.
pub trait HistoryStore: Send + Sync {
    /// Append a result and prune the monitor's history to the current limit.
    fn append(&self, result: &CheckResult) -> Result<AppendOutcome, DbError>;

    /// Remove the oldest entries until at most `limit` remain.
    fn prune_to_limit(&self, monitor_id: MonitorId, limit: RetentionLimit) -> Result<usize, DbError>;

    /// Remove every entry for a monitor, all or nothing.
    fn delete_all(&self, monitor_id: MonitorId) -> Result<usize, DbError>;

    /// All entries for a monitor, oldest first.
    fn query(&self, monitor_id: MonitorId) -> Result<Vec<HistoryEntry>, DbError>;

    /// The most recent entry for a monitor.
    fn latest(&self, monitor_id: MonitorId) -> Result<Option<HistoryEntry>, DbError> {
        Ok(self.query(monitor_id)?.pop())
    }

    fn retention_limit(&self) -> Result<RetentionLimit, DbError>;

    /// Apply a new limit (subject to the configured floor) and prune every
    /// monitor down to it.
    fn set_retention_limit(&self, requested: usize) -> Result<RetentionChange, DbError>;
}
