//! Probe module for endpoint monitoring.
//!
//! Supports HTTP and TCP port probes.

pub mod classify;
mod http;
mod port;

pub use http::*;
pub use port::*;

use crate::db::{ErrorKind, Monitor, MonitorKind};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("TLS failure: {0}")]
    Tls(String),
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    #[error("probe failed: {0}")]
    Unknown(String),
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Timeout(_) => ErrorKind::Timeout,
            ProbeError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            ProbeError::Dns(_) => ErrorKind::Dns,
            ProbeError::Tls(_) => ErrorKind::Tls,
            ProbeError::UnexpectedStatus(_) => ErrorKind::UnexpectedStatus,
            ProbeError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

/// Raw outcome of a single probe attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutcome {
    pub success: bool,
    pub response_time_ms: i64,
    pub status_code: Option<u16>,
    pub error: Option<ProbeError>,
}

impl RawOutcome {
    pub fn success(response_time_ms: i64, status_code: Option<u16>) -> Self {
        Self {
            success: true,
            response_time_ms,
            status_code,
            error: None,
        }
    }

    pub fn failure(response_time_ms: i64, status_code: Option<u16>, error: ProbeError) -> Self {
        Self {
            success: false,
            response_time_ms,
            status_code,
            error: Some(error),
        }
    }
}

/// Performs one probe attempt against a monitor's target.
///
/// Implementations must not mutate the monitor and should release any
/// resources when the returned future is dropped.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, monitor: &Monitor) -> RawOutcome;
}

/// Checker implementations by monitor kind.
#[derive(Clone, Default)]
pub struct Checkers {
    by_kind: HashMap<MonitorKind, Arc<dyn Checker>>,
}

impl Checkers {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The HTTP and port checkers.
    pub fn standard() -> Result<Self, ProbeError> {
        Ok(Self::empty()
            .with(MonitorKind::Http, Arc::new(HttpChecker::new()?))
            .with(MonitorKind::Port, Arc::new(PortChecker)))
    }

    pub fn with(mut self, kind: MonitorKind, checker: Arc<dyn Checker>) -> Self {
        self.by_kind.insert(kind, checker);
        self
    }

    pub fn get(&self, kind: MonitorKind) -> Option<Arc<dyn Checker>> {
        self.by_kind.get(&kind).cloned()
    }
}

/// Run one probe attempt with the monitor's hard deadline.
///
/// The checker future is dropped as soon as the deadline passes or `cancel`
/// fires. Returns `None` when cancelled.
pub async fn run_probe(
    checker: &dyn Checker,
    monitor: &Monitor,
    cancel: &CancellationToken,
) -> Option<RawOutcome> {
    let timeout = monitor.timeout();
    let start = Instant::now();

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        res = tokio::time::timeout(timeout, checker.check(monitor)) => match res {
            Ok(outcome) => outcome,
            Err(_) => RawOutcome::failure(
                classify::elapsed_ms(start),
                None,
                ProbeError::Timeout(timeout),
            ),
        },
    };

    // A response that arrives exactly at the deadline still counts as a timeout
    let deadline_ms = i64::try_from(monitor.timeout_ms).unwrap_or(i64::MAX);
    if outcome.success && outcome.response_time_ms >= deadline_ms {
        return Some(RawOutcome::failure(
            outcome.response_time_ms,
            outcome.status_code,
            ProbeError::Timeout(timeout),
        ));
    }

    Some(outcome)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted checkers shared by tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A checker that replays scripted outcomes, then repeats a fallback.
    pub struct ScriptedChecker {
        script: Mutex<VecDeque<RawOutcome>>,
        fallback: RawOutcome,
        delay: Duration,
        pub calls: AtomicUsize,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
    }

    impl ScriptedChecker {
        pub fn new(script: Vec<RawOutcome>, fallback: RawOutcome) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        pub fn always(outcome: RawOutcome) -> Self {
            Self::new(Vec::new(), outcome)
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    struct ActiveGuard<'a>(&'a AtomicUsize);

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Checker for ScriptedChecker {
        async fn check(&self, _monitor: &Monitor) -> RawOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = ActiveGuard(&self.active);
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub fn refused() -> RawOutcome {
        RawOutcome::failure(3, None, ProbeError::ConnectionRefused("connection refused".into()))
    }

    pub fn ok() -> RawOutcome {
        RawOutcome::success(12, Some(200))
    }
}
