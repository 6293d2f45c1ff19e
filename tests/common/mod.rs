//! Scripted recon service shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use lanwatch::config::{MonitorSettings, NmapSettings, RunnerSettings};
use lanwatch::discovery::NmapEngine;
use lanwatch::recon::{Endpoint, ReconEvent, SessionInfo};
use lanwatch::{ClientProvider, Database, ReconApi, ReconSettings, Role, ScanRunner, WatchError, WatchResult};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How `events` answers
#[derive(Debug, Clone)]
pub enum EventFeed {
    /// The same batch on every poll
    Fixed(Vec<ReconEvent>),
    /// One successful empty poll per session, then a failure
    OkOnceThenFail,
}

pub struct FakeRecon {
    pub commands: Mutex<Vec<String>>,
    /// Outcomes of successive `net.recon on` commands; `default_start_ok` once drained
    pub start_outcomes: Mutex<VecDeque<bool>>,
    pub default_start_ok: bool,
    /// Commands that always fail
    pub failing: Mutex<HashSet<String>>,
    pub feed: EventFeed,
    pub polls_since_start: Mutex<usize>,
    pub hosts: Mutex<Vec<Endpoint>>,
    pub session: Mutex<SessionInfo>,
}

impl FakeRecon {
    pub fn new(feed: EventFeed) -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            start_outcomes: Mutex::new(VecDeque::new()),
            default_start_ok: true,
            failing: Mutex::new(HashSet::new()),
            feed,
            polls_since_start: Mutex::new(0),
            hosts: Mutex::new(Vec::new()),
            session: Mutex::new(SessionInfo::default()),
        })
    }

    pub fn with_starts(feed: EventFeed, outcomes: &[bool], default_start_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            start_outcomes: Mutex::new(outcomes.iter().copied().collect()),
            default_start_ok,
            failing: Mutex::new(HashSet::new()),
            feed,
            polls_since_start: Mutex::new(0),
            hosts: Mutex::new(Vec::new()),
            session: Mutex::new(SessionInfo::default()),
        })
    }

    pub fn fail_command(&self, cmd: &str) {
        self.failing.lock().unwrap().insert(cmd.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, cmd: &str) -> usize {
        self.commands.lock().unwrap().iter().filter(|c| c.as_str() == cmd).count()
    }
}

#[async_trait]
impl ReconApi for FakeRecon {
    async fn run_command(&self, cmd: &str) -> WatchResult<Value> {
        self.commands.lock().unwrap().push(cmd.to_string());

        if self.failing.lock().unwrap().contains(cmd) {
            return Err(WatchError::ToolConnection(format!("'{}' refused", cmd)));
        }
        if cmd == "net.recon on" {
            let ok = self.start_outcomes.lock().unwrap().pop_front().unwrap_or(self.default_start_ok);
            if !ok {
                return Err(WatchError::ToolConnection("connection refused".into()));
            }
            *self.polls_since_start.lock().unwrap() = 0;
        }
        Ok(Value::Null)
    }

    async fn lan_hosts(&self) -> WatchResult<Vec<Endpoint>> {
        Ok(self.hosts.lock().unwrap().clone())
    }

    async fn events(&self, _limit: usize) -> WatchResult<Vec<ReconEvent>> {
        match &self.feed {
            EventFeed::Fixed(batch) => Ok(batch.clone()),
            EventFeed::OkOnceThenFail => {
                let mut polls = self.polls_since_start.lock().unwrap();
                *polls += 1;
                if *polls == 1 {
                    Ok(Vec::new())
                } else {
                    Err(WatchError::ToolTimeout("events".into()))
                }
            }
        }
    }

    async fn session(&self) -> WatchResult<SessionInfo> {
        Ok(self.session.lock().unwrap().clone())
    }
}

/// Hands out one fake client; `configured: false` behaves like an empty store
pub struct FakeProvider {
    pub recon: Arc<FakeRecon>,
    pub configured: bool,
}

impl FakeProvider {
    pub fn new(recon: Arc<FakeRecon>) -> Arc<Self> {
        Arc::new(Self { recon, configured: true })
    }

    pub fn unconfigured(recon: Arc<FakeRecon>) -> Arc<Self> {
        Arc::new(Self { recon, configured: false })
    }
}

#[async_trait]
impl ClientProvider for FakeProvider {
    fn settings(&self) -> WatchResult<ReconSettings> {
        if self.configured {
            Ok(ReconSettings::default())
        } else {
            Err(WatchError::NotConfigured)
        }
    }

    async fn client(&self, _role: Role) -> WatchResult<Arc<dyn ReconApi>> {
        self.settings()?;
        Ok(self.recon.clone())
    }

    async fn invalidate(&self) {}
}

pub fn fast_monitor(max_retries: u32) -> MonitorSettings {
    MonitorSettings {
        event_poll_ms: 5,
        snapshot_interval_ms: 60_000,
        max_retries,
        backoff_ms: 1,
        ..Default::default()
    }
}

pub fn runner(db: &Database, provider: Arc<dyn ClientProvider>) -> ScanRunner {
    ScanRunner::new(
        db.clone(),
        Arc::new(NmapEngine::new(NmapSettings {
            binary: "/nonexistent/lanwatch-nmap".into(),
            ..Default::default()
        })),
        provider,
        RunnerSettings { rest_poll_interval_ms: 5, ..Default::default() },
    )
}

pub fn endpoint_event(id: u64, tag: &str, ip: &str, mac: &str) -> ReconEvent {
    ReconEvent {
        id: Some(id),
        tag: tag.to_string(),
        time: format!("2024-05-01T10:00:{:02}Z", id),
        data: json!({ "ipv4": ip, "mac": mac, "hostname": "", "vendor": "" }),
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
