//! Records persisted in the store

use crate::discovery::Method;
use crate::WatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// One method's view of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    pub last_seen: Option<DateTime<Utc>>,
    pub offline_at: Option<DateTime<Utc>>,
}

impl Liveness {
    pub fn is_online(&self) -> bool {
        self.last_seen.is_some() && self.offline_at.is_none()
    }
}

/// A device in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os: Option<String>,
    pub tags: Option<String>,
    pub note: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub cli: Liveness,
    pub rest: Liveness,
}

impl Device {
    /// Online if either method currently considers it online
    pub fn is_online(&self) -> bool {
        self.cli.is_online() || self.rest.is_online()
    }

    pub fn liveness(&self, method: Method) -> &Liveness {
        match method {
            Method::CliTool => &self.cli,
            Method::RestTool => &self.rest,
        }
    }

    /// Most recent sighting by any method
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.cli.last_seen.max(self.rest.last_seen)
    }
}

/// Method-specific job parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParams {
    /// Extra nmap flags (cli-tool)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nmap_args: Option<String>,
    /// Recon session length in seconds for one-shot recon runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

/// A configured recurring job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub ranges: Vec<String>,
    pub method: Method,
    pub params: JobParams,
    pub cron: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub ranges: Vec<String>,
    pub method: Method,
    #[serde(default)]
    pub params: JobParams,
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update of a job; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub ranges: Option<Vec<String>>,
    pub method: Option<Method>,
    pub params: Option<JobParams>,
    pub cron: Option<String>,
    pub enabled: Option<bool>,
}

impl JobUpdate {
    /// The job as it would look after this update
    pub fn apply_to(&self, job: &ScheduledJob) -> ScheduledJob {
        let mut next = job.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(ranges) = &self.ranges {
            next.ranges = ranges.clone();
        }
        if let Some(method) = self.method {
            next.method = method;
        }
        if let Some(params) = &self.params {
            next.params = params.clone();
        }
        if let Some(cron) = &self.cron {
            next.cron = cron.clone();
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        next
    }
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = WatchError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(WatchError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle of a one-shot run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

text_enum!(RunStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Outcome of one cron firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

text_enum!(ExecutionStatus {
    Running => "running",
    Success => "success",
    Failed => "failed",
});

/// One-shot scan run snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRun {
    pub token: String,
    pub ranges: Vec<String>,
    pub method: Method,
    pub params: JobParams,
    pub status: RunStatus,
    pub progress: u8,
    pub output: String,
    pub total_hosts: u64,
    pub online_count: u64,
    pub new_count: u64,
    pub offline_count: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// History record of a recurring cli-tool job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub online_count: u64,
    pub new_count: u64,
    pub offline_count: u64,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

text_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Error => "error",
});

/// Operational event worth keeping beyond the log stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub event_type: String,
    pub category: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new system event
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub category: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub severity: Severity,
}

impl NewEvent {
    pub fn new(event_type: &str, category: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            category: category.to_string(),
            message: message.into(),
            details: None,
            severity: Severity::Info,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Address on the disruption list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanTarget {
    pub ip: Ipv4Addr,
    pub note: Option<String>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanAction {
    Start,
    Stop,
    Add,
    Remove,
    Update,
}

text_enum!(BanAction {
    Start => "start",
    Stop => "stop",
    Add => "add",
    Remove => "remove",
    Update => "update",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanLogEntry {
    pub id: i64,
    pub action: BanAction,
    pub targets: Vec<Ipv4Addr>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}
