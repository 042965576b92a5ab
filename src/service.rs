//! Site and monitor management on top of the store, scheduler and aggregator.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::SitesFile;
use crate::db::{DbError, HistoryEntry, HistoryStore, Monitor, MonitorId, RetentionLimit, Site, Store};
use crate::probe::Checkers;
use crate::scheduler::{CyclePhase, RetryPolicy, Scheduler, SchedulerError, SchedulerEvent};
use crate::status::{MonitorStatus, SiteStatus, StatusAggregator};

/// Service error types.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Entry point for external callers: persists changes and keeps the
/// scheduler in step with them.
pub struct Monitoring {
    store: Arc<Store>,
    status: Arc<StatusAggregator>,
    scheduler: Scheduler,
}

impl Monitoring {
    pub fn new(store: Arc<Store>, checkers: Checkers, retry: RetryPolicy) -> Self {
        let status = Arc::new(StatusAggregator::new(store.clone()));
        let scheduler = Scheduler::new(status.clone(), checkers, retry);
        Self {
            store,
            status,
            scheduler,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.scheduler.subscribe()
    }

    /// Store the sites and monitors from a monitors file.
    ///
    /// Monitors are matched on site, kind and target: matches are updated in
    /// place (keeping their history), the rest are added. Returns the number
    /// of monitors added.
    pub fn load_sites(&self, file: &SitesFile) -> Result<usize, ServiceError> {
        let mut added = 0;
        for site_cfg in &file.sites {
            let site = site_cfg.to_site();
            self.store.upsert_site(&site)?;

            let existing = self.store.get_site_monitors(&site.identifier)?;
            for monitor_cfg in &site_cfg.monitors {
                let mut monitor = monitor_cfg.to_monitor(&site.identifier);
                match existing
                    .iter()
                    .find(|m| m.kind == monitor.kind && m.target == monitor.target)
                {
                    Some(current) => {
                        monitor.id = current.id;
                        self.store.update_monitor(&monitor)?;
                    }
                    None => {
                        self.store.add_monitor(&mut monitor)?;
                        added += 1;
                    }
                }
            }
            tracing::info!(
                "Loaded site {} ({}) with {} monitors",
                site.identifier,
                site.name(),
                site_cfg.monitors.len()
            );
        }
        Ok(added)
    }

    /// Schedule every stored monitor. Returns how many were scheduled.
    pub async fn start(&self) -> Result<usize, ServiceError> {
        let sites = self.store.get_sites()?;
        let mut count = 0;
        for site in sites {
            for monitor in self.store.get_site_monitors(&site.identifier)? {
                self.schedule(&site, monitor).await?;
                count += 1;
            }
        }
        tracing::info!("Starting scheduler with {} monitors", count);
        Ok(count)
    }

    async fn schedule(&self, site: &Site, mut monitor: Monitor) -> Result<(), ServiceError> {
        // A site with monitoring off runs none of its monitors
        monitor.enabled = monitor.enabled && site.monitoring;
        self.scheduler.add_monitor(monitor).await?;
        Ok(())
    }

    /// Store a new monitor and start checking it.
    pub async fn add_monitor(&self, mut monitor: Monitor) -> Result<MonitorId, ServiceError> {
        let site = self.store.get_site(&monitor.site_identifier)?;
        let id = self.store.add_monitor(&mut monitor)?;
        self.schedule(&site, monitor).await?;
        Ok(id)
    }

    // Control calls persist first; a monitor that is not scheduled yet
    // picks the stored change up at `start()`.

    pub async fn enable(&self, id: MonitorId) -> Result<(), ServiceError> {
        let mut monitor = self.store.get_monitor(id)?;
        monitor.enabled = true;
        self.store.update_monitor(&monitor)?;
        if self.store.get_site(&monitor.site_identifier)?.monitoring {
            unless_unscheduled(self.scheduler.enable(id).await)?;
        }
        Ok(())
    }

    pub async fn disable(&self, id: MonitorId) -> Result<(), ServiceError> {
        let mut monitor = self.store.get_monitor(id)?;
        monitor.enabled = false;
        self.store.update_monitor(&monitor)?;
        unless_unscheduled(self.scheduler.disable(id).await)
    }

    pub async fn update_interval(&self, id: MonitorId, interval_ms: u64) -> Result<(), ServiceError> {
        let mut monitor = self.store.get_monitor(id)?;
        monitor.interval_ms = interval_ms;
        self.store.update_monitor(&monitor)?;
        unless_unscheduled(self.scheduler.update_interval(id, interval_ms).await)
    }

    /// Replace a monitor's target, timings and retry count.
    ///
    /// A scheduled monitor restarts its loop with the new configuration and
    /// keeps its history.
    pub async fn update_monitor(&self, monitor: Monitor) -> Result<(), ServiceError> {
        let site = self.store.get_site(&monitor.site_identifier)?;
        self.store.update_monitor(&monitor)?;

        let mut scheduled = monitor;
        scheduled.enabled = scheduled.enabled && site.monitoring;
        unless_unscheduled(self.scheduler.update_monitor(scheduled).await)
    }

    /// Turn monitoring for a whole site on or off.
    pub async fn set_site_monitoring(&self, identifier: &str, monitoring: bool) -> Result<(), ServiceError> {
        let site = self.store.get_site(identifier)?;
        let updated = Site::new(site.identifier.clone(), Some(site.name()), monitoring);
        self.store.upsert_site(&updated)?;

        for monitor in self.store.get_site_monitors(identifier)? {
            let forwarded = if monitoring && monitor.enabled {
                self.scheduler.enable(monitor.id).await
            } else {
                self.scheduler.disable(monitor.id).await
            };
            unless_unscheduled(forwarded)?;
        }
        Ok(())
    }

    pub fn set_retention_limit(&self, requested: usize) -> Result<RetentionLimit, ServiceError> {
        Ok(self.scheduler.set_retention_limit(requested)?)
    }

    /// Stop a monitor and delete it with its history.
    pub async fn remove_monitor(&self, id: MonitorId) -> Result<(), ServiceError> {
        unless_unscheduled(self.scheduler.remove_monitor(id).await.map(drop))?;
        self.store.delete_monitor(id)?;
        self.status.invalidate(id);
        Ok(())
    }

    /// Stop every monitor of a site and delete the site.
    pub async fn remove_site(&self, identifier: &str) -> Result<(), ServiceError> {
        for monitor in self.store.get_site_monitors(identifier)? {
            unless_unscheduled(self.scheduler.remove_monitor(monitor.id).await.map(drop))?;
        }
        for id in self.store.delete_site(identifier)? {
            self.status.invalidate(id);
        }
        Ok(())
    }

    pub fn monitor_status(&self, id: MonitorId) -> MonitorStatus {
        self.status.monitor_status(id)
    }

    pub fn site_status(&self, identifier: &str) -> Result<SiteStatus, ServiceError> {
        let site = self.store.get_site(identifier)?;
        let monitors = self.store.get_site_monitors(identifier)?;
        Ok(self.status.site_status(&site, &monitors))
    }

    /// Stored history of a monitor, oldest first.
    pub fn history(&self, id: MonitorId) -> Result<Vec<HistoryEntry>, ServiceError> {
        Ok(self.status.query(id)?)
    }

    pub async fn phase(&self, id: MonitorId) -> Option<CyclePhase> {
        self.scheduler.phase(id).await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

/// Treat "not scheduled" as success.
fn unless_unscheduled(result: Result<(), SchedulerError>) -> Result<(), ServiceError> {
    match result {
        Ok(()) | Err(SchedulerError::UnknownMonitor(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
