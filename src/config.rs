//! Configuration module for Sitewatch.
//!
//! Server settings come from environment variables with sensible defaults;
//! sites and monitors come from an optional JSON file.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::db::{HistoryConfig, Monitor, MonitorKind, Site, DEFAULT_RETENTION_FLOOR};
use crate::scheduler::RetryPolicy;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "sitewatch.db")
    pub db_path: String,
    /// Optional JSON file describing sites and monitors
    pub monitors_path: Option<PathBuf>,
    /// Maximum history entries kept per monitor (default: 500)
    pub history_limit: usize,
    /// Smallest non-zero history limit (default: 10)
    pub history_floor: usize,
    /// First retry delay in milliseconds (default: 100)
    pub backoff_base_ms: u64,
    /// Longest retry delay in milliseconds (default: 5000)
    pub backoff_cap_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "sitewatch.db".to_string(),
            monitors_path: None,
            history_limit: 500,
            history_floor: DEFAULT_RETENTION_FLOOR,
            backoff_base_ms: 100,
            backoff_cap_ms: 5000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SITEWATCH_DB_PATH`: Database file path (default: "sitewatch.db")
    /// - `SITEWATCH_MONITORS_PATH`: Sites/monitors JSON file (default: none)
    /// - `SITEWATCH_HISTORY_LIMIT`: History entries per monitor (default: 500)
    /// - `SITEWATCH_HISTORY_FLOOR`: Smallest non-zero history limit (default: 10)
    /// - `SITEWATCH_BACKOFF_BASE_MS`: First retry delay (default: 100)
    /// - `SITEWATCH_BACKOFF_CAP_MS`: Longest retry delay (default: 5000)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("SITEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(path) = env::var("SITEWATCH_MONITORS_PATH") {
            cfg.monitors_path = Some(PathBuf::from(path));
        }

        parse_env("SITEWATCH_HISTORY_LIMIT", &mut cfg.history_limit);
        parse_env("SITEWATCH_HISTORY_FLOOR", &mut cfg.history_floor);
        parse_env("SITEWATCH_BACKOFF_BASE_MS", &mut cfg.backoff_base_ms);
        parse_env("SITEWATCH_BACKOFF_CAP_MS", &mut cfg.backoff_cap_ms);

        cfg
    }

    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            retention_limit: self.history_limit,
            retention_floor: self.history_floor,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }
}

fn parse_env<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}, keeping default", name, raw),
        }
    }
}

/// Sites and monitors as described in the monitors file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitesFile {
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub monitoring: bool,
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub kind: MonitorKind,
    pub target: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl SitesFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl SiteConfig {
    pub fn to_site(&self) -> Site {
        Site::new(self.identifier.clone(), self.name.as_deref(), self.monitoring)
    }
}

impl MonitorConfig {
    /// Build an unsaved monitor (id 0) belonging to `site_identifier`.
    pub fn to_monitor(&self, site_identifier: &str) -> Monitor {
        Monitor {
            id: 0,
            site_identifier: site_identifier.to_string(),
            kind: self.kind,
            target: self.target.clone(),
            interval_ms: self.interval_ms,
            timeout_ms: self.timeout_ms,
            retry_attempts: self.retry_attempts,
            enabled: self.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DEFAULT_SITE_NAME;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.db_path, "sitewatch.db");
        assert_eq!(cfg.history_limit, 500);
        assert_eq!(cfg.history_config().limit().get(), 500);
        let retry = cfg.retry_policy();
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_sites_file_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sites": [{{"identifier": "shop", "monitors": [
                {{"kind": "http", "target": "https://shop.example.com"}},
                {{"kind": "port", "target": "db.example.com:5432", "interval_ms": 5000,
                  "timeout_ms": 1000, "retry_attempts": 2, "enabled": false}}
            ]}}]}}"#
        )
        .unwrap();

        let sites = SitesFile::load(file.path()).unwrap();
        assert_eq!(sites.sites.len(), 1);

        let site = sites.sites[0].to_site();
        assert_eq!(site.name(), DEFAULT_SITE_NAME);
        assert!(site.monitoring);

        let http = sites.sites[0].monitors[0].to_monitor("shop");
        assert_eq!(http.interval_ms, 60_000);
        assert_eq!(http.timeout_ms, 10_000);
        assert_eq!(http.retry_attempts, 0);
        assert!(http.enabled);

        let port = sites.sites[0].monitors[1].to_monitor("shop");
        assert_eq!(port.kind, MonitorKind::Port);
        assert_eq!(port.retry_attempts, 2);
        assert!(!port.enabled);
    }

    #[test]
    fn test_sites_file_errors() {
        assert!(matches!(
            SitesFile::load("/nonexistent/sites.json"),
            Err(ConfigError::Read { .. })
        ));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"sites": [{{"identifier": "x", "monitors": [{{"kind": "ftp", "target": "x"}}]}}]}}"#).unwrap();
        assert!(matches!(SitesFile::load(file.path()), Err(ConfigError::Parse { .. })));
    }
}
