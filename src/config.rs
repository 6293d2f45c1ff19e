//! Configuration module for lanwatch
//!
//! Two layers: `DaemonConfig` is read from TOML at startup and covers paths,
//! tool invocation and loop cadences. `ReconSettings` describes how to reach
//! the recon service and lives in the store so it can change at runtime.

use crate::{WatchError, WatchResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Daemon-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Advisory lock taken by the process that owns the scheduler
    pub lock_path: PathBuf,

    /// System events older than this are removed by the nightly cleanup
    pub event_retention_days: i64,

    /// How often `serve` re-reads jobs edited by other processes
    pub sync_interval_secs: u64,

    pub nmap: NmapSettings,
    pub runner: RunnerSettings,
    pub monitor: MonitorSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanwatch");
        Self {
            database_path: data_dir.join("lanwatch.db"),
            lock_path: std::env::temp_dir().join("lanwatch-scheduler.lock"),
            event_retention_days: 30,
            sync_interval_secs: 30,
            nmap: NmapSettings::default(),
            runner: RunnerSettings::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

/// How the host-discovery binary is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NmapSettings {
    /// Path to nmap binary
    pub binary: String,
    /// Arguments used when a run supplies none
    pub default_args: Vec<String>,
    /// Appended to streamed runs so partial output shows progress
    pub progress_args: Vec<String>,
}

impl Default for NmapSettings {
    fn default() -> Self {
        Self {
            binary: "nmap".to_string(),
            default_args: vec!["-sn".to_string()],
            progress_args: vec!["--stats-every".to_string(), "1s".to_string(), "-v".to_string()],
        }
    }
}

/// One-shot scan runner cadences and bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Persist partial output at least this often
    pub flush_interval_ms: u64,
    /// ...or after this many new lines, whichever comes first
    pub flush_lines: usize,
    /// Partial output keeps only the most recent bytes beyond this size
    pub max_output_bytes: usize,
    /// Error text stored on a failed run is cut to this many characters
    pub max_error_chars: usize,
    /// Host list polling interval for recon-service runs
    pub rest_poll_interval_ms: u64,
    /// Session length for recon-service runs that don't specify one
    pub rest_default_duration_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
            flush_lines: 10,
            max_output_bytes: 50_000,
            max_error_chars: 1000,
            rest_poll_interval_ms: 2000,
            rest_default_duration_secs: 60,
        }
    }
}

impl RunnerSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn rest_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rest_poll_interval_ms)
    }
}

/// Continuous monitor cadences and retry bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub event_poll_ms: u64,
    /// Full host snapshot reconciliation period
    pub snapshot_interval_ms: u64,
    /// Events requested per poll
    pub event_batch: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// Lines kept per journal (raw and friendly each)
    pub journal_capacity: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            event_poll_ms: 2000,
            snapshot_interval_ms: 60_000,
            event_batch: 100,
            max_retries: 10,
            backoff_ms: 10_000,
            journal_capacity: 1000,
        }
    }
}

impl MonitorSettings {
    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn retry_policy(&self) -> crate::error::RetryPolicy {
        crate::error::RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_ms))
    }
}

impl DaemonConfig {
    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> WatchResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| WatchError::Config(format!("Failed to read config file: {}", e)))?;

        let config: DaemonConfig = toml::from_str(&content)
            .map_err(|e| WatchError::Config(format!("Failed to parse TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let path = home_dir.join(".lanwatch.toml");

        if path.exists() {
            match Self::from_toml_file(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", path.display(), e),
            }
        }

        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> WatchResult<()> {
        if self.nmap.binary.trim().is_empty() {
            return Err(WatchError::Config("nmap binary cannot be empty".to_string()));
        }

        if self.runner.flush_lines == 0 || self.runner.max_output_bytes == 0 {
            return Err(WatchError::Config("runner buffer limits must be greater than 0".to_string()));
        }

        if self.monitor.event_poll_ms == 0 || self.monitor.snapshot_interval_ms == 0 {
            return Err(WatchError::Config("monitor intervals must be greater than 0".to_string()));
        }

        if self.monitor.journal_capacity == 0 {
            return Err(WatchError::Config("journal capacity must be greater than 0".to_string()));
        }

        if self.event_retention_days <= 0 {
            return Err(WatchError::Config("event retention must be at least one day".to_string()));
        }

        Ok(())
    }
}

/// Whether the recon service actively probes or only listens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    #[default]
    Active,
    Passive,
}

impl ProbeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMode::Active => "active",
            ProbeMode::Passive => "passive",
        }
    }
}

impl FromStr for ProbeMode {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(ProbeMode::Active),
            "passive" => Ok(ProbeMode::Passive),
            other => Err(WatchError::Validation(format!(
                "probe mode must be 'active' or 'passive', got '{}'",
                other
            ))),
        }
    }
}

/// Connection settings for the recon service, persisted in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconSettings {
    /// Instance used for discovery
    pub scan_url: String,
    /// Instance used for ARP ban
    pub ban_url: String,
    pub username: String,
    pub password: String,
    pub probe_mode: ProbeMode,
    /// Seconds between active probes
    pub probe_throttle: u32,
    /// Per-probe timeout in seconds
    pub probe_timeout: u32,
}

impl Default for ReconSettings {
    fn default() -> Self {
        Self {
            scan_url: "http://127.0.0.1:8081".to_string(),
            ban_url: "http://127.0.0.1:8082".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            probe_mode: ProbeMode::Active,
            probe_throttle: 5,
            probe_timeout: 3,
        }
    }
}

impl ReconSettings {
    /// Validate the settings before they are persisted
    pub fn validate(&self) -> WatchResult<()> {
        for (name, url) in [("scan_url", &self.scan_url), ("ban_url", &self.ban_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(WatchError::Validation(format!(
                    "{} must be an http(s) URL, got '{}'",
                    name, url
                )));
            }
        }

        if self.probe_throttle == 0 {
            return Err(WatchError::Validation("probe throttle must be at least 1".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nmap.default_args, vec!["-sn".to_string()]);
        assert_eq!(config.monitor.retry_policy().max_retries, 10);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "event_retention_days = 7\n[monitor]\nmax_retries = 3").unwrap();

        let config = DaemonConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.event_retention_days, 7);
        assert_eq!(config.monitor.max_retries, 3);
        assert_eq!(config.monitor.event_batch, 100);
        assert_eq!(config.runner.flush_lines, 10);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = DaemonConfig::default();
        config.monitor.journal_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recon_settings_roundtrip_and_validation() {
        let json = r#"{"scan_url":"http://10.0.0.2:8081","probe_mode":"passive"}"#;
        let settings: ReconSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.probe_mode, ProbeMode::Passive);
        assert_eq!(settings.ban_url, "http://127.0.0.1:8082");
        assert!(settings.validate().is_ok());

        let bad = ReconSettings { scan_url: "10.0.0.2".into(), ..Default::default() };
        assert!(bad.validate().is_err());
        assert!("bogus".parse::<ProbeMode>().is_err());
    }
}
