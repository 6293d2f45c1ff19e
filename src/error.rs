//! Error handling for lanwatch
//!
//! One error enum covers range parsing, the external tools, the store and
//! scheduling rejections. Failures from the recon service are classified by
//! cause so callers can tell an unreachable service from a rejected command.

use std::time::Duration;
use thiserror::Error;

/// Main error type for inventory operations
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Invalid network range: {0}")]
    InvalidRange(String),

    #[error("Recon service is not configured")]
    NotConfigured,

    #[error("No disruption targets configured")]
    NoTargets,

    #[error("Cannot connect to recon service: {0}")]
    ToolConnection(String),

    #[error("Recon service timed out: {0}")]
    ToolTimeout(String),

    #[error("Recon service returned HTTP {status}: {body}")]
    ToolProtocol { status: u16, body: String },

    #[error("Recon service error: {0}")]
    ToolUnknown(String),

    #[error("Scan process failed (exit code {code:?}): {message}")]
    ProcessExecution { code: Option<i32>, message: String },

    #[error("Only one recon job may be enabled; job {job_id} ({name}) already is")]
    SchedulingConflict { job_id: i64, name: String },

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for inventory operations
pub type WatchResult<T> = Result<T, WatchError>;

impl WatchError {
    /// True for failures reported while talking to the recon service
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            WatchError::ToolConnection(_)
                | WatchError::ToolTimeout(_)
                | WatchError::ToolProtocol { .. }
                | WatchError::ToolUnknown(_)
        )
    }

    /// Short label used in logs and persisted event details
    pub fn kind(&self) -> &'static str {
        match self {
            WatchError::InvalidRange(_) => "invalid_range",
            WatchError::NotConfigured => "not_configured",
            WatchError::NoTargets => "no_targets",
            WatchError::ToolConnection(_) => "connection",
            WatchError::ToolTimeout(_) => "timeout",
            WatchError::ToolProtocol { .. } => "http_status",
            WatchError::ToolUnknown(_) => "unknown",
            WatchError::ProcessExecution { .. } => "process",
            WatchError::SchedulingConflict { .. } => "conflict",
            WatchError::InvalidCron { .. } => "invalid_cron",
            WatchError::Validation(_) => "validation",
            WatchError::NotFound(_) => "not_found",
            WatchError::Config(_) => "config",
            WatchError::Storage(_) | WatchError::LockPoisoned => "storage",
            WatchError::Io(_) => "io",
            WatchError::Serialization(_) => "serialization",
        }
    }
}

impl From<reqwest::Error> for WatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            WatchError::ToolTimeout(e.to_string())
        } else if e.is_connect() {
            WatchError::ToolConnection(e.to_string())
        } else if let Some(status) = e.status() {
            WatchError::ToolProtocol {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            WatchError::ToolUnknown(e.to_string())
        }
    }
}

impl From<ipnetwork::IpNetworkError> for WatchError {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        WatchError::InvalidRange(e.to_string())
    }
}

/// Cut error text down to `max_chars` characters for persisted records.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Bounded retry settings for long-running loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before giving up
    pub max_retries: u32,
    /// Fixed pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("abcdef", 3), "abc");
        assert_eq!(truncate_message("abc", 10), "abc");
        assert_eq!(truncate_message("ééé", 2), "éé");
    }

    #[test]
    fn test_retry_policy_bound() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_tool_error_classification() {
        assert!(WatchError::ToolTimeout("slow".into()).is_tool_error());
        assert!(WatchError::ToolProtocol { status: 500, body: String::new() }.is_tool_error());
        assert!(!WatchError::NoTargets.is_tool_error());
        assert_eq!(WatchError::ToolConnection("x".into()).kind(), "connection");
    }
}
