//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Stable identifier of a monitor (the `monitors` row id).
pub type MonitorId = i64;

/// Response time recorded when no duration could be measured.
///
/// `0` is a valid (very fast) measurement, so it is never used as a marker.
pub const UNMEASURED_MS: i64 = -1;

/// Name given to sites created without one.
pub const DEFAULT_SITE_NAME: &str = "Unnamed Site";

/// Smallest non-zero retention limit accepted by default.
pub const DEFAULT_RETENTION_FLOOR: usize = 10;

/// The probe used to check a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    Http,
    Port,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Http => "http",
            MonitorKind::Port => "port",
        }
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(MonitorKind::Http),
            "port" => Ok(MonitorKind::Port),
            other => Err(format!("unknown monitor kind: {}", other)),
        }
    }
}

/// A logical group of monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Site {
    pub identifier: String,
    name: String,
    pub monitoring: bool,
}

impl Site {
    /// Create a site. Blank or missing names become [`DEFAULT_SITE_NAME`].
    pub fn new(identifier: impl Into<String>, name: Option<&str>, monitoring: bool) -> Self {
        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => DEFAULT_SITE_NAME.to_string(),
        };
        Self {
            identifier: identifier.into(),
            name,
            monitoring,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A single checkable endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: MonitorId,
    pub site_identifier: String,
    pub kind: MonitorKind,
    /// URL for HTTP monitors, `host:port` for port monitors
    pub target: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub enabled: bool,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            id: 0,
            site_identifier: String::new(),
            kind: MonitorKind::Http,
            target: String::new(),
            interval_ms: 60_000,
            timeout_ms: 10_000,
            retry_attempts: 0,
            enabled: true,
        }
    }
}

impl Monitor {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check the invariants a monitor must satisfy before it is stored or scheduled.
    pub fn validate(&self) -> Result<(), String> {
        if self.target.trim().is_empty() {
            return Err("target cannot be empty".to_string());
        }
        if self.interval_ms == 0 {
            return Err("interval_ms must be greater than zero".to_string());
        }
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than zero".to_string());
        }
        if self.kind == MonitorKind::Port && !has_port(&self.target) {
            return Err(format!("port target must be host:port, got {}", self.target));
        }
        Ok(())
    }
}

fn has_port(target: &str) -> bool {
    target
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().map_or(false, |p| p > 0))
        .unwrap_or(false)
}

/// Outcome of a completed check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
        }
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(CheckStatus::Up),
            "down" => Ok(CheckStatus::Down),
            other => Err(format!("invalid check status: {:?}", other)),
        }
    }
}

/// Closed set of failure categories a probe error is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ConnectionRefused,
    Dns,
    Tls,
    UnexpectedStatus,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::Dns => "dns",
            ErrorKind::Tls => "tls",
            ErrorKind::UnexpectedStatus => "unexpected_status",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(ErrorKind::Timeout),
            "connection_refused" => Ok(ErrorKind::ConnectionRefused),
            "dns" => Ok(ErrorKind::Dns),
            "tls" => Ok(ErrorKind::Tls),
            "unexpected_status" => Ok(ErrorKind::UnexpectedStatus),
            "unknown" => Ok(ErrorKind::Unknown),
            other => Err(format!("invalid error kind: {:?}", other)),
        }
    }
}

/// Immutable record of one completed check cycle, after retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub monitor_id: MonitorId,
    pub timestamp: DateTime<Utc>,
    pub status: CheckStatus,
    /// Duration of the deciding attempt, or [`UNMEASURED_MS`]
    pub response_time_ms: i64,
    pub status_code: Option<u16>,
    /// Present only when `status` is `Down`
    pub error_kind: Option<ErrorKind>,
    /// Present only when `status` is `Down`
    pub error_detail: Option<String>,
}

impl CheckResult {
    pub fn up(
        monitor_id: MonitorId,
        timestamp: DateTime<Utc>,
        response_time_ms: i64,
        status_code: Option<u16>,
    ) -> Self {
        Self {
            monitor_id,
            timestamp,
            status: CheckStatus::Up,
            response_time_ms,
            status_code,
            error_kind: None,
            error_detail: None,
        }
    }

    pub fn down(
        monitor_id: MonitorId,
        timestamp: DateTime<Utc>,
        response_time_ms: i64,
        status_code: Option<u16>,
        kind: ErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            monitor_id,
            timestamp,
            status: CheckStatus::Down,
            response_time_ms,
            status_code,
            error_kind: Some(kind),
            error_detail: Some(detail.into()),
        }
    }
}

/// A stored check result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub result: CheckResult,
}

/// Maximum number of history entries kept per monitor.
///
/// `0` keeps nothing. Any other value below the floor is raised to the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionLimit(usize);

impl RetentionLimit {
    pub fn new(requested: usize, floor: usize) -> Self {
        if requested == 0 {
            return Self(0);
        }
        if requested < floor {
            tracing::info!(
                "Retention limit {} is below the floor of {}, using {}",
                requested,
                floor,
                floor
            );
            return Self(floor);
        }
        Self(requested)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for RetentionLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// History configuration injected into a store at construction.
#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    pub retention_limit: usize,
    pub retention_floor: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_limit: 500,
            retention_floor: DEFAULT_RETENTION_FLOOR,
        }
    }
}

impl HistoryConfig {
    pub fn limit(&self) -> RetentionLimit {
        RetentionLimit::new(self.retention_limit, self.retention_floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_name_defaults() {
        assert_eq!(Site::new("a", None, true).name(), DEFAULT_SITE_NAME);
        assert_eq!(Site::new("a", Some(""), true).name(), DEFAULT_SITE_NAME);
        assert_eq!(Site::new("a", Some("   "), true).name(), DEFAULT_SITE_NAME);
        assert_eq!(Site::new("a", Some(" Shop "), true).name(), "Shop");
    }

    #[test]
    fn test_retention_limit_policy() {
        // Zero is kept as "retain nothing"
        assert_eq!(RetentionLimit::new(0, 10).get(), 0);
        // Small positive values are raised to the floor
        assert_eq!(RetentionLimit::new(1, 10).get(), 10);
        assert_eq!(RetentionLimit::new(9, 10).get(), 10);
        // Values at or above the floor are kept
        assert_eq!(RetentionLimit::new(10, 10).get(), 10);
        assert_eq!(RetentionLimit::new(250, 10).get(), 250);
        // A zero floor disables raising
        assert_eq!(RetentionLimit::new(3, 0).get(), 3);
    }

    #[test]
    fn test_monitor_validation() {
        let mut monitor = Monitor {
            target: "https://example.com".to_string(),
            ..Default::default()
        };
        assert!(monitor.validate().is_ok());

        monitor.interval_ms = 0;
        assert!(monitor.validate().is_err());

        monitor.interval_ms = 1000;
        monitor.kind = MonitorKind::Port;
        monitor.target = "example.com".to_string();
        assert!(monitor.validate().is_err());

        monitor.target = "example.com:443".to_string();
        assert!(monitor.validate().is_ok());

        monitor.target = "example.com:0".to_string();
        assert!(monitor.validate().is_err());
    }

    #[test]
    fn test_status_parsing_rejects_unknown_values() {
        assert_eq!("up".parse::<CheckStatus>(), Ok(CheckStatus::Up));
        assert_eq!("down".parse::<CheckStatus>(), Ok(CheckStatus::Down));
        assert!("".parse::<CheckStatus>().is_err());
        assert!("DOWN".parse::<CheckStatus>().is_err());
    }

    #[test]
    fn test_error_kind_round_trips_through_storage_names() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::ConnectionRefused,
            ErrorKind::Dns,
            ErrorKind::Tls,
            ErrorKind::UnexpectedStatus,
            ErrorKind::Unknown,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>(), Ok(kind));
        }
    }
}
