//! TCP port probe implementation.

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;

use super::classify::{classify_io_error, elapsed_ms};
use super::{Checker, ProbeError, RawOutcome};
use crate::db::Monitor;

/// Checks that a TCP connection to `host:port` can be opened.
///
/// The connection is closed immediately after it is established.
pub struct PortChecker;

#[async_trait]
impl Checker for PortChecker {
    async fn check(&self, monitor: &Monitor) -> RawOutcome {
        let timeout = monitor.timeout();
        let start = Instant::now();

        let addrs: Vec<_> = match lookup_host(monitor.target.as_str()).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                return RawOutcome::failure(
                    elapsed_ms(start),
                    None,
                    ProbeError::Dns(format!("{}: {}", monitor.target, e)),
                )
            }
        };
        if addrs.is_empty() {
            return RawOutcome::failure(
                elapsed_ms(start),
                None,
                ProbeError::Dns(format!("no addresses found for {}", monitor.target)),
            );
        }

        match TcpStream::connect(addrs.as_slice()).await {
            Ok(stream) => {
                let latency = elapsed_ms(start);
                drop(stream);
                RawOutcome::success(latency, None)
            }
            Err(e) => RawOutcome::failure(elapsed_ms(start), None, classify_io_error(&e, timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ErrorKind, MonitorKind};
    use tokio::net::TcpListener;

    fn monitor(target: String) -> Monitor {
        Monitor {
            id: 1,
            kind: MonitorKind::Port,
            target,
            timeout_ms: 2000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_port_probe_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let outcome = PortChecker.check(&monitor(addr.to_string())).await;
        assert!(outcome.success);
        assert!(outcome.response_time_ms >= 0);
        assert_eq!(outcome.status_code, None);
    }

    #[tokio::test]
    async fn test_port_probe_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = PortChecker.check(&monitor(addr.to_string())).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_port_probe_bad_target() {
        let outcome = PortChecker.check(&monitor("missing-port".to_string())).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::Dns));
    }
}
