//! Scheduler module for running periodic monitor checks.

mod retry;

pub use retry::*;

use crate::db::{CheckResult, CheckStatus, DbError, HistoryStore, Monitor, MonitorId, MonitorKind, RetentionLimit};
use crate::probe::{Checker, Checkers};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long `remove_monitor` waits for an in-flight cycle to wind down.
const REMOVE_GRACE: Duration = Duration::from_secs(2);

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("monitor {0} is not scheduled")]
    UnknownMonitor(MonitorId),
    #[error("no checker registered for {0} monitors")]
    NoChecker(MonitorKind),
    #[error("invalid monitor: {0}")]
    InvalidMonitor(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Where a monitor is in its check loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Idle,
    Running,
    Disabled,
    Stopped,
}

/// Events emitted for logging/metrics consumers.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A cycle finished and its result was stored
    CycleCompleted { monitor_id: MonitorId, result: CheckResult },
    /// Old history entries were removed to respect the retention limit
    HistoryPruned { monitor_id: MonitorId, removed_count: usize },
    /// A cycle finished but its result could not be stored
    ResultUndelivered {
        monitor_id: MonitorId,
        result: CheckResult,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MonitorSettings {
    enabled: bool,
    interval: Duration,
}

struct MonitorTask {
    settings: watch::Sender<MonitorSettings>,
    phase: watch::Receiver<CyclePhase>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything a monitor loop needs, independent of the scheduler.
struct CycleContext {
    monitor: Monitor,
    checker: Arc<dyn Checker>,
    store: Arc<dyn HistoryStore>,
    retry: RetryPolicy,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Drives one independent check loop per monitor.
pub struct Scheduler {
    store: Arc<dyn HistoryStore>,
    checkers: Checkers,
    retry: RetryPolicy,
    tasks: Arc<RwLock<HashMap<MonitorId, MonitorTask>>>,
    events: broadcast::Sender<SchedulerEvent>,
    root: CancellationToken,
}

impl Scheduler {
    /// Create a new scheduler writing results to the given store.
    pub fn new(store: Arc<dyn HistoryStore>, checkers: Checkers, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            checkers,
            retry,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            events,
            root: CancellationToken::new(),
        }
    }

    /// Subscribe to cycle and pruning events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Start the check loop for a monitor. Does nothing if it is already scheduled.
    pub async fn add_monitor(&self, monitor: Monitor) -> Result<(), SchedulerError> {
        monitor.validate().map_err(SchedulerError::InvalidMonitor)?;
        let checker = self
            .checkers
            .get(monitor.kind)
            .ok_or(SchedulerError::NoChecker(monitor.kind))?;

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&monitor.id) {
            return Ok(());
        }

        tracing::info!(
            "Scheduler: Adding {} monitor {} ({}) every {:?}",
            monitor.kind,
            monitor.id,
            monitor.target,
            monitor.interval()
        );

        let (settings_tx, settings_rx) = watch::channel(MonitorSettings {
            enabled: monitor.enabled,
            interval: monitor.interval(),
        });
        let initial = if monitor.enabled { CyclePhase::Idle } else { CyclePhase::Disabled };
        let (phase_tx, phase_rx) = watch::channel(initial);
        let cancel = self.root.child_token();

        let id = monitor.id;
        let ctx = CycleContext {
            monitor,
            checker,
            store: self.store.clone(),
            retry: self.retry,
            events: self.events.clone(),
        };
        let handle = tokio::spawn(run_monitor_loop(ctx, settings_rx, phase_tx, cancel.clone()));

        tasks.insert(
            id,
            MonitorTask {
                settings: settings_tx,
                phase: phase_rx,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Resume scheduling a monitor. The next cycle starts immediately.
    pub async fn enable(&self, id: MonitorId) -> Result<(), SchedulerError> {
        self.modify(id, |s| {
            let changed = !s.enabled;
            s.enabled = true;
            changed
        })
        .await
    }

    /// Stop scheduling a monitor. An in-flight cycle still completes and is recorded.
    pub async fn disable(&self, id: MonitorId) -> Result<(), SchedulerError> {
        self.modify(id, |s| {
            let changed = s.enabled;
            s.enabled = false;
            changed
        })
        .await
    }

    /// Change the check interval. Applies from the most recent cycle start.
    pub async fn update_interval(&self, id: MonitorId, interval_ms: u64) -> Result<(), SchedulerError> {
        if interval_ms == 0 {
            return Err(SchedulerError::InvalidMonitor(
                "interval_ms must be greater than zero".to_string(),
            ));
        }
        let interval = Duration::from_millis(interval_ms);
        self.modify(id, |s| {
            let changed = s.interval != interval;
            s.interval = interval;
            changed
        })
        .await
    }

    async fn modify(
        &self,
        id: MonitorId,
        f: impl FnOnce(&mut MonitorSettings) -> bool,
    ) -> Result<(), SchedulerError> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(&id).ok_or(SchedulerError::UnknownMonitor(id))?;
        task.settings.send_if_modified(f);
        Ok(())
    }

    /// Replace a monitor's configuration, restarting its loop. History is kept.
    pub async fn update_monitor(&self, monitor: Monitor) -> Result<(), SchedulerError> {
        monitor.validate().map_err(SchedulerError::InvalidMonitor)?;
        self.stop_task(monitor.id).await?;
        self.add_monitor(monitor).await
    }

    /// Apply a new retention limit and report what was pruned.
    pub fn set_retention_limit(&self, requested: usize) -> Result<RetentionLimit, SchedulerError> {
        let change = self.store.set_retention_limit(requested)?;
        tracing::info!("Retention limit set to {}", change.limit);
        for (monitor_id, removed_count) in change.pruned {
            let _ = self.events.send(SchedulerEvent::HistoryPruned {
                monitor_id,
                removed_count,
            });
        }
        Ok(change.limit)
    }

    /// Stop a monitor for good and delete its history.
    ///
    /// An in-flight probe or backoff wait is aborted and its result discarded.
    /// Returns the number of history entries removed.
    pub async fn remove_monitor(&self, id: MonitorId) -> Result<usize, SchedulerError> {
        self.stop_task(id).await?;
        let removed = self.store.delete_all(id)?;
        tracing::info!("Scheduler: Removed monitor {} ({} history entries)", id, removed);
        Ok(removed)
    }

    async fn stop_task(&self, id: MonitorId) -> Result<(), SchedulerError> {
        let task = self
            .tasks
            .write()
            .await
            .remove(&id)
            .ok_or(SchedulerError::UnknownMonitor(id))?;

        task.cancel.cancel();
        let mut handle = task.handle;
        if tokio::time::timeout(REMOVE_GRACE, &mut handle).await.is_err() {
            tracing::warn!("Scheduler: Monitor {} did not stop within {:?}, aborting", id, REMOVE_GRACE);
            handle.abort();
        }
        Ok(())
    }

    /// Current loop phase of a monitor, if it is scheduled.
    pub async fn phase(&self, id: MonitorId) -> Option<CyclePhase> {
        self.tasks.read().await.get(&id).map(|t| *t.phase.borrow())
    }

    /// Cancel every monitor loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let tasks: Vec<_> = self.tasks.write().await.drain().collect();
        for (id, task) in tasks {
            if let Err(e) = task.handle.await {
                tracing::warn!("Scheduler: Monitor {} task ended abnormally: {}", id, e);
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Run the check loop for a single monitor.
///
/// The next cycle is due one interval after the previous cycle started, and
/// never begins before that cycle has finished.
async fn run_monitor_loop(
    ctx: CycleContext,
    mut settings_rx: watch::Receiver<MonitorSettings>,
    phase: watch::Sender<CyclePhase>,
    cancel: CancellationToken,
) {
    let id = ctx.monitor.id;
    let mut last_start: Option<Instant> = None;

    loop {
        let settings = *settings_rx.borrow_and_update();

        if !settings.enabled {
            phase.send_replace(CyclePhase::Disabled);
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Re-enabling starts a fresh schedule
                    last_start = None;
                    continue;
                }
            }
        }

        let next_due = last_start.map_or_else(Instant::now, |start| start + settings.interval);
        phase.send_replace(CyclePhase::Idle);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep_until(next_due) => {}
        }

        phase.send_replace(CyclePhase::Running);
        let start = Instant::now();
        last_start = Some(start);

        if !run_cycle(&ctx, &cancel).await {
            break;
        }
        tracing::debug!("Monitor {}: cycle took {:?}", id, start.elapsed());
    }

    phase.send_replace(CyclePhase::Stopped);
    tracing::debug!("Monitor {}: check loop stopped", id);
}

/// Run one cycle: probe with retries, then store the result.
///
/// Returns `false` if the monitor was cancelled before the result was stored.
async fn run_cycle(ctx: &CycleContext, cancel: &CancellationToken) -> bool {
    let monitor = &ctx.monitor;

    let outcome = match ctx.retry.run(monitor, ctx.checker.as_ref(), cancel).await {
        Some(outcome) => outcome,
        None => {
            tracing::debug!("Monitor {}: cycle cancelled, discarding", monitor.id);
            return false;
        }
    };
    if cancel.is_cancelled() {
        return false;
    }

    let result = outcome.result;
    if result.status == CheckStatus::Down {
        tracing::warn!(
            "Monitor {} ({}) is down after {} attempt(s): {}",
            monitor.id,
            monitor.target,
            outcome.attempts,
            result.error_detail.as_deref().unwrap_or("no detail")
        );
    }

    match ctx.store.append(&result) {
        Ok(appended) => {
            let _ = ctx.events.send(SchedulerEvent::CycleCompleted {
                monitor_id: monitor.id,
                result,
            });
            if appended.removed > 0 {
                let _ = ctx.events.send(SchedulerEvent::HistoryPruned {
                    monitor_id: monitor.id,
                    removed_count: appended.removed,
                });
            }
        }
        Err(e) => {
            tracing::error!(
                "Monitor {}: check result undelivered, history store failed: {}",
                monitor.id,
                e
            );
            let _ = ctx.events.send(SchedulerEvent::ResultUndelivered {
                monitor_id: monitor.id,
                result,
                error: e.to_string(),
            });
        }
    }

    true
}
