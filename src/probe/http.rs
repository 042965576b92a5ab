//! HTTP probe implementation.

use async_trait::async_trait;
use reqwest::redirect::Policy;
use tokio::time::Instant;

use super::classify::{classify_reqwest_error, elapsed_ms};
use super::{Checker, ProbeError, RawOutcome};
use crate::db::{Monitor, UNMEASURED_MS};

/// Highest status code treated as success by default (2xx and 3xx).
pub const DEFAULT_MAX_SUCCESS_STATUS: u16 = 399;

/// Checks HTTP(S) endpoints with a GET request.
///
/// Redirects are not followed, so a 3xx response is judged on its own.
pub struct HttpChecker {
    client: reqwest::Client,
    max_success_status: u16,
}

impl HttpChecker {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| ProbeError::Unknown(e.to_string()))?;

        Ok(Self {
            client,
            max_success_status: DEFAULT_MAX_SUCCESS_STATUS,
        })
    }

    /// Treat 2xx statuses and 3xx statuses up to and including `status` as success.
    pub fn with_max_success_status(mut self, status: u16) -> Self {
        self.max_success_status = status;
        self
    }

    fn is_success(&self, status: u16) -> bool {
        (200..=self.max_success_status).contains(&status)
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn check(&self, monitor: &Monitor) -> RawOutcome {
        let url = normalize_url(&monitor.target);
        let timeout = monitor.timeout();

        let request = match self.client.get(&url).timeout(timeout).build() {
            Ok(request) => request,
            Err(e) => {
                return RawOutcome::failure(
                    UNMEASURED_MS,
                    None,
                    ProbeError::Unknown(format!("invalid target {}: {}", url, e)),
                )
            }
        };

        let start = Instant::now();

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                return RawOutcome::failure(elapsed_ms(start), None, classify_reqwest_error(&e, timeout))
            }
        };
        let status = response.status().as_u16();

        // Read the full body to measure complete transfer time
        if let Err(e) = response.bytes().await {
            return RawOutcome::failure(elapsed_ms(start), Some(status), classify_reqwest_error(&e, timeout));
        }
        let latency = elapsed_ms(start);

        if self.is_success(status) {
            RawOutcome::success(latency, Some(status))
        } else {
            RawOutcome::failure(latency, Some(status), ProbeError::UnexpectedStatus(status))
        }
    }
}

fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ErrorKind, MonitorKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP response on a local port.
    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                status_line
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{}/health", addr)
    }

    fn monitor(target: String) -> Monitor {
        Monitor {
            id: 1,
            kind: MonitorKind::Http,
            target,
            timeout_ms: 2000,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("example.com"), "http://example.com");
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_success_status_range() {
        let checker = HttpChecker::new().unwrap();
        assert!(!checker.is_success(101));
        assert!(!checker.is_success(199));
        assert!(checker.is_success(200));
        assert!(checker.is_success(399));
        assert!(!checker.is_success(400));

        let strict = HttpChecker::new().unwrap().with_max_success_status(299);
        assert!(strict.is_success(204));
        assert!(!strict.is_success(302));
    }

    #[tokio::test]
    async fn test_http_probe_success() {
        let url = serve_once("200 OK").await;
        let outcome = HttpChecker::new().unwrap().check(&monitor(url)).await;
        assert!(outcome.success);
        assert_eq!(outcome.status_code, Some(200));
        assert!(outcome.response_time_ms >= 0);
    }

    #[tokio::test]
    async fn test_http_probe_redirect_is_success() {
        let url = serve_once("301 Moved Permanently").await;
        let outcome = HttpChecker::new().unwrap().check(&monitor(url)).await;
        assert!(outcome.success);
        assert_eq!(outcome.status_code, Some(301));
    }

    #[tokio::test]
    async fn test_http_probe_server_error() {
        let url = serve_once("503 Service Unavailable").await;
        let outcome = HttpChecker::new().unwrap().check(&monitor(url)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(ProbeError::UnexpectedStatus(503)));
    }

    #[tokio::test]
    async fn test_http_probe_custom_threshold() {
        let url = serve_once("301 Moved Permanently").await;
        let checker = HttpChecker::new().unwrap().with_max_success_status(299);
        let outcome = checker.check(&monitor(url)).await;
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::UnexpectedStatus));
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        // Bind and drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = HttpChecker::new()
            .unwrap()
            .check(&monitor(format!("http://{}", addr)))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.map(|e| e.kind()), Some(ErrorKind::ConnectionRefused));
    }
}
