//! Result classification: raw probe outcomes into check results.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::{ProbeError, RawOutcome};
use crate::db::{CheckResult, MonitorId, UNMEASURED_MS};

/// Milliseconds since `start`, saturating at `i64::MAX`.
pub fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Build the check result for the deciding attempt of a cycle.
pub fn classify(monitor_id: MonitorId, timestamp: DateTime<Utc>, outcome: RawOutcome) -> CheckResult {
    let response_time_ms = if outcome.response_time_ms < 0 {
        UNMEASURED_MS
    } else {
        outcome.response_time_ms
    };

    if outcome.success {
        return CheckResult::up(monitor_id, timestamp, response_time_ms, outcome.status_code);
    }

    let error = match outcome.error {
        Some(e) => e,
        None => {
            tracing::warn!(
                "Monitor {}: probe reported failure without an error, recording as unknown",
                monitor_id
            );
            ProbeError::Unknown("probe reported failure without detail".to_string())
        }
    };

    CheckResult::down(
        monitor_id,
        timestamp,
        response_time_ms,
        outcome.status_code,
        error.kind(),
        error.to_string(),
    )
}

/// Map an I/O error from a socket operation onto the probe taxonomy.
pub fn classify_io_error(err: &io::Error, timeout: Duration) -> ProbeError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused(err.to_string()),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout(timeout),
        _ => {
            let message = err.to_string();
            if looks_like_dns(&message) {
                ProbeError::Dns(message)
            } else if looks_like_tls(&message) {
                ProbeError::Tls(message)
            } else {
                ProbeError::Unknown(message)
            }
        }
    }
}

/// Map a reqwest error onto the probe taxonomy by walking its source chain.
pub fn classify_reqwest_error(err: &reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::Timeout(timeout);
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return ProbeError::ConnectionRefused(io_err.to_string());
            }
        }
        source = cause.source();
    }

    let message = error_chain(err);
    if message.to_ascii_lowercase().contains("connection refused") {
        ProbeError::ConnectionRefused(message)
    } else if looks_like_dns(&message) {
        ProbeError::Dns(message)
    } else if looks_like_tls(&message) {
        ProbeError::Tls(message)
    } else {
        ProbeError::Unknown(message)
    }
}

/// Flatten an error and its causes into one line.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn looks_like_dns(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "nodename nor servname",
        "no such host",
        "temporary failure in name resolution",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

fn looks_like_tls(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckStatus, ErrorKind};

    #[test]
    fn test_classify_success() {
        let now = Utc::now();
        let result = classify(9, now, RawOutcome::success(42, Some(204)));
        assert_eq!(result.status, CheckStatus::Up);
        assert_eq!(result.response_time_ms, 42);
        assert_eq!(result.status_code, Some(204));
        assert!(result.error_kind.is_none());
        assert!(result.error_detail.is_none());
    }

    #[test]
    fn test_classify_failure_keeps_detail() {
        let result = classify(
            9,
            Utc::now(),
            RawOutcome::failure(17, Some(503), ProbeError::UnexpectedStatus(503)),
        );
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.response_time_ms, 17);
        assert_eq!(result.error_kind, Some(ErrorKind::UnexpectedStatus));
        assert_eq!(result.error_detail.as_deref(), Some("unexpected HTTP status 503"));
    }

    #[test]
    fn test_classify_failure_without_error_is_flagged() {
        let outcome = RawOutcome {
            success: false,
            response_time_ms: -5,
            status_code: None,
            error: None,
        };
        let result = classify(1, Utc::now(), outcome);
        assert_eq!(result.status, CheckStatus::Down);
        assert_eq!(result.error_kind, Some(ErrorKind::Unknown));
        assert_eq!(result.response_time_ms, UNMEASURED_MS);
        assert!(result.error_detail.is_some());
    }

    #[test]
    fn test_classify_io_errors() {
        let timeout = Duration::from_secs(1);
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_io_error(&refused, timeout).kind(), ErrorKind::ConnectionRefused);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert_eq!(classify_io_error(&timed_out, timeout), ProbeError::Timeout(timeout));

        let dns = io::Error::new(
            io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        assert_eq!(classify_io_error(&dns, timeout).kind(), ErrorKind::Dns);

        let other = io::Error::new(io::ErrorKind::Other, "network unreachable");
        assert_eq!(classify_io_error(&other, timeout).kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_elapsed_is_never_negative() {
        assert!(elapsed_ms(Instant::now()) >= 0);
    }
}
