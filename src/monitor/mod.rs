//! Continuous monitors for recurring recon jobs
//!
//! Each enabled recon job owns one long-lived task that keeps the service's
//! discovery modules running, tails its event feed into the registry and
//! periodically reconciles a full host snapshot. The task restarts the
//! session after faults with a bounded retry budget and always tries to
//! switch the modules off on the way out.

pub mod journal;

pub use journal::{Journal, JournalKind};

use crate::config::{MonitorSettings, ProbeMode, ReconSettings};
use crate::discovery::{Method, Observations};
use crate::recon::{ClientProvider, EventKind, ReconApi, ReconEvent, Role};
use crate::reconcile::Reconciler;
use crate::store::{Database, NewEvent, ScheduledJob, Severity};
use crate::utils::cidr;
use crate::{WatchError, WatchResult};
use futures::future::join_all;
use ipnetwork::Ipv4Network;
use log::{debug, error, warn};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a monitor task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Stopped on request
    Cancelled,
    /// No connection settings; nothing was attempted
    NotConfigured,
    /// Gave up after the retry budget was spent
    RetriesExhausted { attempts: u32, last_error: String },
}

struct MonitorSlot {
    cancel: CancellationToken,
    handle: JoinHandle<MonitorExit>,
}

/// Owns every running monitor, keyed by job id
pub struct MonitorRegistry {
    db: Database,
    clients: Arc<dyn ClientProvider>,
    settings: MonitorSettings,
    slots: Mutex<HashMap<i64, MonitorSlot>>,
    journals: StdMutex<HashMap<i64, Arc<Journal>>>,
}

impl MonitorRegistry {
    pub fn new(db: Database, clients: Arc<dyn ClientProvider>, settings: MonitorSettings) -> Self {
        Self {
            db,
            clients,
            settings,
            slots: Mutex::new(HashMap::new()),
            journals: StdMutex::new(HashMap::new()),
        }
    }

    /// Start the monitor for `job`, replacing a running one.
    ///
    /// The previous instance is cancelled and fully torn down before the
    /// new one is spawned, so two sessions never drive the service at once.
    pub async fn start(&self, job: &ScheduledJob) -> WatchResult<()> {
        if job.method != Method::RestTool {
            return Err(WatchError::Validation(format!("job {} is not a recon job", job.id)));
        }
        let networks = cidr::parse_ranges(&job.ranges)?;

        let mut slots = self.slots.lock().await;
        if let Some(previous) = slots.remove(&job.id) {
            debug!("Replacing monitor for job {}", job.id);
            teardown(job.id, previous).await;
        }

        let cancel = CancellationToken::new();
        let task = MonitorTask {
            job_id: job.id,
            ranges: job.ranges.clone(),
            networks,
            db: self.db.clone(),
            reconciler: Reconciler::new(self.db.clone()),
            clients: Arc::clone(&self.clients),
            settings: self.settings.clone(),
            journal: self.journal(job.id),
            watermark: Watermark::default(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());
        slots.insert(job.id, MonitorSlot { cancel, handle });
        Ok(())
    }

    /// Cancel and await the monitor for `job_id`; false if none was registered
    pub async fn stop(&self, job_id: i64) -> bool {
        let slot = self.slots.lock().await.remove(&job_id);
        match slot {
            Some(slot) => {
                teardown(job_id, slot).await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(i64, MonitorSlot)> = self.slots.lock().await.drain().collect();
        join_all(drained.into_iter().map(|(job_id, slot)| teardown(job_id, slot))).await;
    }

    /// Wait for a monitor to end on its own and return how it ended
    pub async fn join(&self, job_id: i64) -> Option<MonitorExit> {
        let slot = self.slots.lock().await.remove(&job_id)?;
        match slot.handle.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                error!("Monitor for job {} panicked: {}", job_id, e);
                None
            }
        }
    }

    /// Job ids whose monitor task is still alive
    pub async fn active_ids(&self) -> Vec<i64> {
        let slots = self.slots.lock().await;
        let mut ids: Vec<i64> = slots
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn is_running(&self, job_id: i64) -> bool {
        self.slots
            .lock()
            .await
            .get(&job_id)
            .map(|slot| !slot.handle.is_finished())
            .unwrap_or(false)
    }

    /// Journal lines for a job; empty when it never ran in this process
    pub fn logs(&self, job_id: i64, kind: JournalKind) -> Vec<String> {
        let journals = self.journals.lock().unwrap_or_else(|e| e.into_inner());
        journals.get(&job_id).map(|j| j.lines(kind)).unwrap_or_default()
    }

    fn journal(&self, job_id: i64) -> Arc<Journal> {
        let mut journals = self.journals.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            journals
                .entry(job_id)
                .or_insert_with(|| Arc::new(Journal::new(job_id, self.settings.journal_capacity))),
        )
    }
}

async fn teardown(job_id: i64, slot: MonitorSlot) {
    slot.cancel.cancel();
    match slot.handle.await {
        Ok(exit) => debug!("Monitor for job {} ended: {:?}", job_id, exit),
        Err(e) => error!("Monitor for job {} panicked: {}", job_id, e),
    }
}

/// Event de-duplication state.
///
/// Ids are used when the service provides them; otherwise the event
/// timestamp must move strictly forward. Events with neither are only
/// applied from the first batch.
#[derive(Debug, Default)]
struct Watermark {
    last_id: Option<u64>,
    last_time: Option<String>,
    primed: bool,
}

impl Watermark {
    fn admit(&mut self, event: &ReconEvent) -> bool {
        if let Some(id) = event.id {
            if self.last_id.map_or(false, |last| id <= last) {
                return false;
            }
            self.last_id = Some(id);
            return true;
        }

        if event.time.is_empty() {
            return !self.primed;
        }
        if self.last_time.as_deref().map_or(false, |last| event.time.as_str() <= last) {
            return false;
        }
        self.last_time = Some(event.time.clone());
        true
    }

    fn finish_batch(&mut self) {
        self.primed = true;
    }
}

struct MonitorTask {
    job_id: i64,
    ranges: Vec<String>,
    networks: Vec<Ipv4Network>,
    db: Database,
    reconciler: Reconciler,
    clients: Arc<dyn ClientProvider>,
    settings: MonitorSettings,
    journal: Arc<Journal>,
    watermark: Watermark,
    cancel: CancellationToken,
}

impl MonitorTask {
    async fn run(mut self) -> MonitorExit {
        let policy = self.settings.retry_policy();
        let cancel = self.cancel.clone();
        let mut failures: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return self.cancelled(),
                connected = self.connect() => connected,
            };

            let fault = match connected {
                Err(WatchError::NotConfigured) => {
                    error!("Recon job {}: service not configured, monitor not started", self.job_id);
                    self.journal.friendly("recon service not configured; monitor stopped");
                    return MonitorExit::NotConfigured;
                }
                Err(e) => e,
                Ok((settings, client)) => {
                    if failures > 0 {
                        self.record(
                            NewEvent::new(
                                "recon_restart",
                                "monitor",
                                format!("Restarting recon session for job {} (attempt {})", self.job_id, failures + 1),
                            )
                            .with_severity(Severity::Warning)
                            .with_details(json!({ "job_id": self.job_id, "retry": failures })),
                        );
                    }

                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = self.session(client.as_ref(), &settings, &mut failures) => Some(result),
                    };
                    self.stop_modules(client.as_ref()).await;

                    match outcome {
                        None => return self.cancelled(),
                        Some(Err(e)) => e,
                        Some(Ok(never)) => match never {},
                    }
                }
            };

            failures += 1;
            warn!(
                "Recon job {} {} fault ({}/{}): {}",
                self.job_id,
                fault.kind(),
                failures,
                policy.max_retries,
                fault
            );
            self.journal.friendly(&format!("session error: {}", fault));

            if !policy.should_retry(failures) {
                error!("Recon job {}: giving up after {} attempts", self.job_id, failures);
                self.journal.friendly("retry limit reached; monitor stopped");
                self.record(
                    NewEvent::new(
                        "recon_monitor_failed",
                        "monitor",
                        format!("Recon monitor for job {} stopped after {} attempts", self.job_id, failures),
                    )
                    .with_severity(Severity::Error)
                    .with_details(json!({ "job_id": self.job_id, "kind": fault.kind(), "error": fault.to_string() })),
                );
                return MonitorExit::RetriesExhausted {
                    attempts: failures,
                    last_error: fault.to_string(),
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => return self.cancelled(),
                _ = tokio::time::sleep(policy.backoff) => {}
            }
        }
    }

    fn cancelled(&self) -> MonitorExit {
        self.journal.friendly("monitor stopped");
        MonitorExit::Cancelled
    }

    async fn connect(&self) -> WatchResult<(ReconSettings, Arc<dyn ReconApi>)> {
        let settings = self.clients.settings()?;
        let client = self.clients.client(Role::Scan).await?;
        Ok((settings, client))
    }

    /// Start modules, then tail until something fails
    async fn session(
        &mut self,
        client: &dyn ReconApi,
        settings: &ReconSettings,
        failures: &mut u32,
    ) -> WatchResult<Infallible> {
        self.start_modules(client, settings).await?;

        let mut last_snapshot = Instant::now();
        loop {
            self.drain_events(client).await?;

            if last_snapshot.elapsed() >= self.settings.snapshot_interval() {
                self.snapshot(client).await?;
                last_snapshot = Instant::now();
            }

            if *failures > 0 {
                debug!("Recon job {} healthy again, retry counter reset", self.job_id);
                *failures = 0;
            }

            tokio::time::sleep(self.settings.event_poll()).await;
        }
    }

    /// Leaves the service's host table alone: hosts found by a previous
    /// session stay visible to the next snapshot
    async fn start_modules(&self, client: &dyn ReconApi, settings: &ReconSettings) -> WatchResult<()> {
        if let Some(first) = self.ranges.first() {
            client.run_command(&format!("set net.recon.targets {}", first)).await?;
        }

        match settings.probe_mode {
            ProbeMode::Active => {
                client
                    .run_command(&format!("set net.probe.throttle {}", settings.probe_throttle))
                    .await?;
                client.run_command("set net.probe.mdns true").await?;
                client
                    .run_command(&format!("set net.probe.timeout {}", settings.probe_timeout))
                    .await?;
                client.run_command("net.recon on").await?;
                client.run_command("net.probe on").await?;
            }
            ProbeMode::Passive => {
                client.run_command("net.recon on").await?;
            }
        }

        self.journal
            .friendly(&format!("recon modules started ({} mode)", settings.probe_mode.as_str()));
        self.record(
            NewEvent::new(
                "recon_modules_started",
                "monitor",
                format!("Recon modules started for job {}", self.job_id),
            )
            .with_details(json!({ "job_id": self.job_id, "mode": settings.probe_mode.as_str() })),
        );
        Ok(())
    }

    /// Each module is switched off independently; failures are only logged
    async fn stop_modules(&self, client: &dyn ReconApi) {
        for command in ["net.probe off", "net.recon off"] {
            if let Err(e) = client.run_command(command).await {
                debug!("Recon job {}: '{}' failed: {}", self.job_id, command, e);
            }
        }
    }

    async fn drain_events(&mut self, client: &dyn ReconApi) -> WatchResult<()> {
        let mut events = client.events(self.settings.event_batch).await?;
        events.reverse();

        for event in events {
            if self.watermark.admit(&event) {
                self.apply_event(&event);
            }
        }
        self.watermark.finish_batch();
        Ok(())
    }

    fn apply_event(&self, event: &ReconEvent) {
        self.journal.raw(&event.raw_line());

        match event.kind() {
            EventKind::EndpointNew(endpoint) => {
                let Some(ip) = self.in_scope(endpoint.ip()) else { return };
                self.journal.friendly(&event.friendly_line());
                if let Err(e) = self.reconciler.observe(ip, &endpoint.to_host_info(), Method::RestTool) {
                    warn!("Recon job {}: failed to record {}: {}", self.job_id, ip, e);
                }
            }
            EventKind::EndpointLost(endpoint) => {
                let Some(ip) = self.in_scope(endpoint.ip()) else { return };
                self.journal.friendly(&event.friendly_line());
                if let Err(e) = self.reconciler.mark_lost(ip, Method::RestTool) {
                    warn!("Recon job {}: failed to mark {} offline: {}", self.job_id, ip, e);
                }
            }
            EventKind::SysLog { .. } => self.journal.friendly(&event.friendly_line()),
            EventKind::Wireless | EventKind::Other => debug!("Recon job {}: {} ignored", self.job_id, event.tag),
        }
    }

    fn in_scope(&self, ip: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        ip.filter(|ip| self.networks.is_empty() || cidr::in_any(&self.networks, *ip))
    }

    async fn snapshot(&self, client: &dyn ReconApi) -> WatchResult<()> {
        let observations: Observations = client
            .lan_hosts()
            .await?
            .iter()
            .filter_map(|endpoint| Some((self.in_scope(endpoint.ip())?, endpoint.to_host_info())))
            .collect();

        let stats = self
            .reconciler
            .reconcile(
                &observations,
                Method::RestTool,
                !self.networks.is_empty(),
                Some(self.networks.as_slice()),
            )?;
        self.journal.friendly(&format!(
            "snapshot: {} hosts, {} new, {} went offline",
            observations.len(),
            stats.new,
            stats.offline
        ));
        Ok(())
    }

    fn record(&self, event: NewEvent) {
        if let Err(e) = self.db.record_event(&event) {
            warn!("Failed to record system event: {}", e);
        }
    }
}
