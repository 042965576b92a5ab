//! Monitor and site status derived from stored check history.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::db::{
    AppendOutcome, CheckResult, CheckStatus, DbError, HistoryEntry, HistoryStore, Monitor,
    MonitorId, RetentionChange, RetentionLimit, Site,
};

/// Current status of a single monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MonitorStatus {
    /// No check result stored yet
    Pending,
    Up,
    Down { detail: Option<String> },
    /// History could not be read; says nothing about the endpoint itself
    HistoryUnavailable,
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorStatus::Pending => write!(f, "pending"),
            MonitorStatus::Up => write!(f, "up"),
            MonitorStatus::Down { detail: Some(d) } => write!(f, "down ({})", d),
            MonitorStatus::Down { detail: None } => write!(f, "down"),
            MonitorStatus::HistoryUnavailable => write!(f, "history unavailable"),
        }
    }
}

/// Aggregate status of a site's enabled monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Up,
    Down,
    /// At least one enabled monitor has not reported yet
    Pending,
    /// Monitoring is off for the site, or it has no enabled monitors
    Paused,
    HistoryUnavailable,
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SiteStatus::Up => "up",
            SiteStatus::Down => "down",
            SiteStatus::Pending => "pending",
            SiteStatus::Paused => "paused",
            SiteStatus::HistoryUnavailable => "history unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Cache {
    statuses: HashMap<MonitorId, MonitorStatus>,
    /// Monitors whose last append failed; cleared by the next successful one
    undelivered: HashSet<MonitorId>,
}

impl Cache {
    fn get(&self, monitor_id: MonitorId) -> Option<MonitorStatus> {
        if self.undelivered.contains(&monitor_id) {
            return Some(MonitorStatus::HistoryUnavailable);
        }
        self.statuses.get(&monitor_id).cloned()
    }

    fn forget(&mut self, monitor_id: MonitorId) {
        self.statuses.remove(&monitor_id);
        self.undelivered.remove(&monitor_id);
    }
}

/// Derives statuses from a history store, with a read-through cache.
///
/// All history mutations should go through the aggregator (it implements
/// [`HistoryStore`] itself) so the cache entry for a monitor is dropped while
/// the write is still holding the cache lock. A failed append marks the
/// monitor [`MonitorStatus::HistoryUnavailable`] until an append succeeds.
pub struct StatusAggregator {
    store: Arc<dyn HistoryStore>,
    cache: RwLock<Cache>,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Status of the most recent stored result for a monitor.
    pub fn monitor_status(&self, monitor_id: MonitorId) -> MonitorStatus {
        if let Ok(cache) = self.cache.read() {
            if let Some(status) = cache.get(monitor_id) {
                return status;
            }
        }

        // Compute under the write lock so a concurrent append cannot slip in
        // between the read and the cache fill.
        let mut cache = match self.cache.write() {
            Ok(cache) => cache,
            Err(_) => {
                tracing::error!("Status cache lock poisoned");
                return MonitorStatus::HistoryUnavailable;
            }
        };
        if let Some(status) = cache.get(monitor_id) {
            return status;
        }

        match self.store.latest(monitor_id) {
            Ok(latest) => {
                let status = status_of(latest.as_ref());
                cache.statuses.insert(monitor_id, status.clone());
                status
            }
            Err(e) => {
                tracing::error!("Monitor {}: history unavailable: {}", monitor_id, e);
                MonitorStatus::HistoryUnavailable
            }
        }
    }

    /// Status of a site. Disabled monitors are ignored entirely.
    pub fn site_status(&self, site: &Site, monitors: &[Monitor]) -> SiteStatus {
        if !site.monitoring {
            return SiteStatus::Paused;
        }

        let statuses: Vec<MonitorStatus> = monitors
            .iter()
            .filter(|m| m.enabled && m.site_identifier == site.identifier)
            .map(|m| self.monitor_status(m.id))
            .collect();

        aggregate(&statuses)
    }

    /// Drop everything cached for a monitor, including a failed-write mark.
    pub fn invalidate(&self, monitor_id: MonitorId) {
        match self.cache.write() {
            Ok(mut cache) => cache.forget(monitor_id),
            Err(poisoned) => poisoned.into_inner().forget(monitor_id),
        }
    }

    /// Run a mutation while holding the cache write lock, then drop the
    /// affected entries.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&dyn HistoryStore) -> Result<T, DbError>,
        affected: impl FnOnce(&T) -> Vec<MonitorId>,
    ) -> Result<T, DbError> {
        let mut cache = self.cache.write().map_err(|_| DbError::Poisoned)?;
        let result = op(self.store.as_ref());
        match &result {
            Ok(value) => {
                for id in affected(value) {
                    cache.statuses.remove(&id);
                }
            }
            // The store may or may not have applied the change
            Err(_) => cache.statuses.clear(),
        }
        result
    }
}

fn status_of(latest: Option<&HistoryEntry>) -> MonitorStatus {
    match latest {
        None => MonitorStatus::Pending,
        Some(entry) => match entry.result.status {
            CheckStatus::Up => MonitorStatus::Up,
            CheckStatus::Down => MonitorStatus::Down {
                detail: entry.result.error_detail.clone(),
            },
        },
    }
}

/// Combine enabled monitor statuses into a site status.
fn aggregate(statuses: &[MonitorStatus]) -> SiteStatus {
    if statuses.is_empty() {
        return SiteStatus::Paused;
    }
    if statuses.iter().any(|s| matches!(s, MonitorStatus::Down { .. })) {
        return SiteStatus::Down;
    }
    if statuses.contains(&MonitorStatus::HistoryUnavailable) {
        return SiteStatus::HistoryUnavailable;
    }
    if statuses.contains(&MonitorStatus::Pending) {
        return SiteStatus::Pending;
    }
    SiteStatus::Up
}

impl HistoryStore for StatusAggregator {
    fn append(&self, result: &CheckResult) -> Result<AppendOutcome, DbError> {
        let id = result.monitor_id;
        let mut cache = self.cache.write().map_err(|_| DbError::Poisoned)?;
        let outcome = self.store.append(result);
        match &outcome {
            Ok(_) => cache.forget(id),
            Err(_) => {
                cache.statuses.clear();
                cache.undelivered.insert(id);
            }
        }
        outcome
    }

    fn prune_to_limit(&self, monitor_id: MonitorId, limit: RetentionLimit) -> Result<usize, DbError> {
        self.mutate(|store| store.prune_to_limit(monitor_id, limit), |_| vec![monitor_id])
    }

    fn delete_all(&self, monitor_id: MonitorId) -> Result<usize, DbError> {
        let removed = self.mutate(|store| store.delete_all(monitor_id), |_| vec![monitor_id])?;
        self.invalidate(monitor_id);
        Ok(removed)
    }

    fn query(&self, monitor_id: MonitorId) -> Result<Vec<HistoryEntry>, DbError> {
        self.store.query(monitor_id)
    }

    fn latest(&self, monitor_id: MonitorId) -> Result<Option<HistoryEntry>, DbError> {
        self.store.latest(monitor_id)
    }

    fn retention_limit(&self) -> Result<RetentionLimit, DbError> {
        self.store.retention_limit()
    }

    fn set_retention_limit(&self, requested: usize) -> Result<RetentionChange, DbError> {
        self.mutate(
            |store| store.set_retention_limit(requested),
            |change| change.pruned.iter().map(|(id, _)| *id).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ErrorKind, HistoryConfig, Store};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A real store whose appends can be switched to fail while reads keep working.
    struct FailingWrites {
        inner: Store,
        failing: AtomicBool,
    }

    impl HistoryStore for FailingWrites {
        fn append(&self, result: &CheckResult) -> Result<AppendOutcome, DbError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DbError::Migration("disk I/O error".to_string()));
            }
            self.inner.append(result)
        }
        fn prune_to_limit(&self, monitor_id: MonitorId, limit: RetentionLimit) -> Result<usize, DbError> {
            self.inner.prune_to_limit(monitor_id, limit)
        }
        fn delete_all(&self, monitor_id: MonitorId) -> Result<usize, DbError> {
            self.inner.delete_all(monitor_id)
        }
        fn query(&self, monitor_id: MonitorId) -> Result<Vec<HistoryEntry>, DbError> {
            self.inner.query(monitor_id)
        }
        fn retention_limit(&self) -> Result<RetentionLimit, DbError> {
            self.inner.retention_limit()
        }
        fn set_retention_limit(&self, requested: usize) -> Result<RetentionChange, DbError> {
            self.inner.set_retention_limit(requested)
        }
    }

    fn aggregator() -> StatusAggregator {
        let store = Store::open_in_memory(HistoryConfig::default()).unwrap();
        StatusAggregator::new(Arc::new(store))
    }

    fn up(id: MonitorId) -> CheckResult {
        CheckResult::up(id, Utc::now(), 10, Some(200))
    }

    fn down(id: MonitorId) -> CheckResult {
        CheckResult::down(id, Utc::now(), 10, None, ErrorKind::Timeout, "probe timed out after 1s")
    }

    fn monitor(id: MonitorId, enabled: bool) -> Monitor {
        Monitor {
            id,
            site_identifier: "shop".to_string(),
            target: format!("https://example.com/{}", id),
            enabled,
            ..Default::default()
        }
    }

    #[test]
    fn test_monitor_status_follows_latest_result() {
        let agg = aggregator();
        assert_eq!(agg.monitor_status(1), MonitorStatus::Pending);

        agg.append(&up(1)).unwrap();
        assert_eq!(agg.monitor_status(1), MonitorStatus::Up);

        // Cached value must not survive a new append
        agg.append(&down(1)).unwrap();
        assert_eq!(
            agg.monitor_status(1),
            MonitorStatus::Down {
                detail: Some("probe timed out after 1s".to_string())
            }
        );

        agg.delete_all(1).unwrap();
        assert_eq!(agg.monitor_status(1), MonitorStatus::Pending);
    }

    #[test]
    fn test_site_down_when_any_enabled_monitor_down() {
        let agg = aggregator();
        let site = Site::new("shop", Some("Shop"), true);
        agg.append(&up(1)).unwrap();
        agg.append(&up(2)).unwrap();
        agg.append(&down(3)).unwrap();
        // Disabled monitor that happens to be down
        agg.append(&down(4)).unwrap();

        let monitors = vec![monitor(1, true), monitor(2, true), monitor(3, true), monitor(4, false)];
        assert_eq!(agg.site_status(&site, &monitors), SiteStatus::Down);
    }

    #[test]
    fn test_site_up_ignores_disabled_monitors() {
        let agg = aggregator();
        let site = Site::new("shop", Some("Shop"), true);
        agg.append(&up(1)).unwrap();
        agg.append(&up(2)).unwrap();
        agg.append(&down(3)).unwrap();

        let monitors = vec![monitor(1, true), monitor(2, true), monitor(3, false)];
        assert_eq!(agg.site_status(&site, &monitors), SiteStatus::Up);
    }

    #[test]
    fn test_site_pending_and_paused() {
        let agg = aggregator();
        let site = Site::new("shop", None, true);
        agg.append(&up(1)).unwrap();

        let monitors = vec![monitor(1, true), monitor(2, true)];
        assert_eq!(agg.site_status(&site, &monitors), SiteStatus::Pending);

        let disabled = vec![monitor(1, false)];
        assert_eq!(agg.site_status(&site, &disabled), SiteStatus::Paused);

        let paused_site = Site::new("shop", None, false);
        assert_eq!(agg.site_status(&paused_site, &monitors), SiteStatus::Paused);
    }

    #[test]
    fn test_retention_change_invalidates_pruned_monitors() {
        let agg = aggregator();
        agg.append(&up(1)).unwrap();
        assert_eq!(agg.monitor_status(1), MonitorStatus::Up);

        agg.set_retention_limit(0).unwrap();
        assert_eq!(agg.monitor_status(1), MonitorStatus::Pending);
    }

    #[test]
    fn test_failed_append_marks_history_unavailable() {
        let store = Arc::new(FailingWrites {
            inner: Store::open_in_memory(HistoryConfig::default()).unwrap(),
            failing: AtomicBool::new(false),
        });
        let agg = StatusAggregator::new(store.clone());
        let site = Site::new("shop", Some("Shop"), true);
        let monitors = vec![monitor(1, true), monitor(2, true)];

        agg.append(&up(1)).unwrap();
        agg.append(&up(2)).unwrap();
        assert_eq!(agg.monitor_status(1), MonitorStatus::Up);

        store.failing.store(true, Ordering::SeqCst);
        assert!(agg.append(&down(1)).is_err());

        // The stored row still says up, but the newest result was lost
        assert_eq!(agg.monitor_status(1), MonitorStatus::HistoryUnavailable);
        assert_eq!(agg.monitor_status(1), MonitorStatus::HistoryUnavailable);
        assert_eq!(agg.monitor_status(2), MonitorStatus::Up);
        assert_eq!(agg.site_status(&site, &monitors), SiteStatus::HistoryUnavailable);

        // Unrelated mutations do not clear the mark
        agg.set_retention_limit(0).unwrap();
        agg.set_retention_limit(500).unwrap();
        assert_eq!(agg.monitor_status(1), MonitorStatus::HistoryUnavailable);

        store.failing.store(false, Ordering::SeqCst);
        agg.append(&down(1)).unwrap();
        assert!(matches!(agg.monitor_status(1), MonitorStatus::Down { .. }));
        assert_eq!(agg.site_status(&site, &monitors), SiteStatus::Down);
    }

    #[test]
    fn test_aggregate_prefers_down_over_unavailable() {
        let statuses = vec![
            MonitorStatus::HistoryUnavailable,
            MonitorStatus::Down { detail: None },
            MonitorStatus::Up,
        ];
        assert_eq!(aggregate(&statuses), SiteStatus::Down);
        assert_eq!(
            aggregate(&[MonitorStatus::Up, MonitorStatus::HistoryUnavailable]),
            SiteStatus::HistoryUnavailable
        );
    }
}
