//! One-shot scan runs
//!
//! A run is created `pending`, executed on a background task and always
//! ends `completed` or `failed`. Progress and the tail of the tool output
//! are persisted while it executes so callers can poll by token.

pub mod buffer;

pub use buffer::OutputBuffer;

use crate::config::RunnerSettings;
use crate::discovery::{parse_nmap_output, Method, NmapEngine, NmapOutput, Observations};
use crate::error::truncate_message;
use crate::recon::{ClientProvider, ReconApi, Role};
use crate::reconcile::{ReconcileStats, Reconciler};
use crate::store::{Database, JobParams, RunStatus, ScanRun};
use crate::utils::{cidr, network};
use crate::{WatchError, WatchResult};
use chrono::Utc;
use ipnetwork::Ipv4Network;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// What to scan and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub ranges: Vec<String>,
    pub method: Method,
    #[serde(default)]
    pub params: JobParams,
}

/// Result of a raw nmap sweep plus reconciliation
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub stats: ReconcileStats,
    pub online: u64,
    pub output: NmapOutput,
}

/// Executes one-shot runs and exposes their status
#[derive(Clone)]
pub struct ScanRunner {
    db: Database,
    reconciler: Reconciler,
    nmap: Arc<NmapEngine>,
    clients: Arc<dyn ClientProvider>,
    settings: RunnerSettings,
}

impl ScanRunner {
    pub fn new(
        db: Database,
        nmap: Arc<NmapEngine>,
        clients: Arc<dyn ClientProvider>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(db.clone()),
            db,
            nmap,
            clients,
            settings,
        }
    }

    /// Validate and persist a pending run, returning its token.
    ///
    /// Malformed ranges are rejected here; everything after this point is
    /// captured in the run record instead of being returned.
    pub fn create(&self, request: &ScanRequest) -> WatchResult<ScanRun> {
        let networks = cidr::parse_ranges(&request.ranges)?;
        if request.method == Method::CliTool && request.ranges.is_empty() {
            return Err(WatchError::Validation("nmap scans need at least one range".to_string()));
        }

        let total_hosts = cidr::host_count(&networks);
        let run = ScanRun {
            token: uuid::Uuid::new_v4().to_string(),
            ranges: request.ranges.clone(),
            method: request.method,
            params: request.params.clone(),
            status: RunStatus::Pending,
            progress: 0,
            output: String::new(),
            total_hosts,
            online_count: 0,
            new_count: 0,
            offline_count: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.db.save_run(&run)?;
        Ok(run)
    }

    /// Fire-and-forget submission
    pub fn submit(&self, request: ScanRequest) -> WatchResult<String> {
        let run = self.create(&request)?;
        let token = run.token.clone();
        let runner = self.clone();
        tokio::spawn(async move {
            runner.execute(run).await;
        });
        info!("Submitted {} scan {}", request.method, token);
        Ok(token)
    }

    /// Create and execute inline, returning the terminal record
    pub async fn run_to_completion(&self, request: ScanRequest) -> WatchResult<ScanRun> {
        let run = self.create(&request)?;
        Ok(self.execute(run).await)
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn status(&self, token: &str) -> WatchResult<Option<ScanRun>> {
        self.db.get_run(token)
    }

    pub fn recent(&self, limit: usize) -> WatchResult<Vec<ScanRun>> {
        self.db.recent_runs(limit)
    }

    /// Drive a pending run to a terminal state. Never fails: errors end up
    /// in the run record.
    pub async fn execute(&self, mut run: ScanRun) -> ScanRun {
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run.progress = 5;
        self.persist(&run);

        let result = match run.method {
            Method::CliTool => self.execute_cli(&mut run).await,
            Method::RestTool => self.execute_rest(&mut run).await,
        };

        match result {
            Ok((stats, online)) => {
                run.status = RunStatus::Completed;
                run.progress = 100;
                run.online_count = online;
                run.new_count = stats.new;
                run.offline_count = stats.offline;
                info!(
                    "Scan {} completed: {} online, {} new, {} offline",
                    run.token, online, stats.new, stats.offline
                );
            }
            Err(e) => {
                error!("Scan {} failed: {}", run.token, e);
                run.status = RunStatus::Failed;
                run.error = Some(truncate_message(&e.to_string(), self.settings.max_error_chars));
            }
        }

        run.finished_at = Some(Utc::now());
        self.persist(&run);
        run
    }

    fn persist(&self, run: &ScanRun) {
        if let Err(e) = self.db.save_run(run) {
            warn!("Failed to save scan run {}: {}", run.token, e);
        }
    }

    async fn execute_cli(&self, run: &mut ScanRun) -> WatchResult<(ReconcileStats, u64)> {
        run.progress = 10;
        self.persist(run);

        let mut buffer = OutputBuffer::new(
            self.settings.max_output_bytes,
            self.settings.flush_lines,
            self.settings.flush_interval(),
        );
        run.progress = 20;
        self.persist(run);

        let token = run.token.clone();
        let streamed = self
            .nmap
            .run_streaming(&run.ranges, run.params.nmap_args.as_deref(), |line| {
                if buffer.push_line(line) {
                    if let Err(e) = self.db.update_run_progress(&token, 20, buffer.as_str()) {
                        debug!("Progress write for {} failed: {}", token, e);
                    }
                    buffer.mark_flushed();
                }
            })
            .await;
        run.output = buffer.into_string();
        let output = streamed?;

        run.progress = 70;
        self.persist(run);

        let mut observations = parse_nmap_output(&output.stdout);
        fill_local_identity(&mut observations).await;
        run.progress = 80;
        self.persist(run);

        let expected = cidr::parse_ranges(&run.ranges)?;
        let stats = self
            .reconciler
            .reconcile(&observations, Method::CliTool, true, Some(expected.as_slice()))?;
        Ok((stats, observations.len() as u64))
    }

    async fn execute_rest(&self, run: &mut ScanRun) -> WatchResult<(ReconcileStats, u64)> {
        let networks = cidr::parse_ranges(&run.ranges)?;
        let client = self.clients.client(Role::Scan).await?;

        client.run_command("net.clear").await?;
        client.run_command("net.probe on").await?;
        run.progress = 10;
        self.persist(run);

        let duration = Duration::from_secs(
            run.params
                .duration_secs
                .unwrap_or(self.settings.rest_default_duration_secs),
        );
        let polled = self.poll_hosts(client.as_ref(), run, &networks, duration).await;

        if let Err(e) = client.run_command("net.probe off").await {
            warn!("Failed to stop probing after scan {}: {}", run.token, e);
        }
        let observations = polled?;
        run.progress = 75;
        self.persist(run);

        run.output = observations
            .iter()
            .map(|(ip, info)| format!("{} {}", ip, info.mac.as_deref().unwrap_or("-")))
            .collect::<Vec<_>>()
            .join("\n");
        run.progress = 80;
        self.persist(run);

        let expected = (!networks.is_empty()).then_some(networks.as_slice());
        let stats = self
            .reconciler
            .reconcile(&observations, Method::RestTool, expected.is_some(), expected)?;
        Ok((stats, observations.len() as u64))
    }

    async fn poll_hosts(
        &self,
        client: &dyn ReconApi,
        run: &ScanRun,
        networks: &[Ipv4Network],
        duration: Duration,
    ) -> WatchResult<Observations> {
        let interval = self.settings.rest_poll_interval();
        let total = poll_count(duration, interval);
        let mut observations = Observations::new();

        for i in 0..total {
            tokio::time::sleep(interval).await;
            for endpoint in client.lan_hosts().await? {
                let Some(ip) = endpoint.ip() else { continue };
                if !networks.is_empty() && !cidr::in_any(networks, ip) {
                    continue;
                }
                observations.insert(ip, endpoint.to_host_info());
            }

            let progress = 10 + ((i + 1) * 60 / total) as u8;
            if let Err(e) = self.db.update_run_progress(&run.token, progress, "") {
                debug!("Progress write for {} failed: {}", run.token, e);
            }
        }

        Ok(observations)
    }

    /// Run nmap for a recurring job and reconcile against its ranges
    pub async fn sweep(&self, ranges: &[String], params: &JobParams) -> WatchResult<SweepOutcome> {
        let expected = cidr::parse_ranges(ranges)?;
        let output = self.nmap.run(ranges, params.nmap_args.as_deref()).await?;
        let mut observations = parse_nmap_output(&output.stdout);
        fill_local_identity(&mut observations).await;
        let stats = self
            .reconciler
            .reconcile(&observations, Method::CliTool, true, Some(expected.as_slice()))?;
        Ok(SweepOutcome {
            stats,
            online: observations.len() as u64,
            output,
        })
    }
}

/// Number of polls for a session; at least one
fn poll_count(duration: Duration, interval: Duration) -> u64 {
    let interval_ms = interval.as_millis().max(1);
    ((duration.as_millis() / interval_ms) as u64).max(1)
}

/// nmap never reports a MAC for the scanning host itself; take it from the
/// local interfaces so the host still gets a registry entry
async fn fill_local_identity(observations: &mut Observations) {
    if observations.values().all(|info| info.mac.is_some()) {
        return;
    }
    merge_local_identity(observations, &network::local_interface_macs().await);
}

fn merge_local_identity(observations: &mut Observations, local: &HashMap<Ipv4Addr, String>) {
    for (ip, info) in observations.iter_mut() {
        if info.mac.is_some() {
            continue;
        }
        let Some(mac) = local.get(ip) else { continue };
        debug!("{} is a local interface, using its MAC {}", ip, mac);
        if info.vendor.is_none() {
            info.vendor = network::virtual_nic_vendor(mac).map(str::to_string);
        }
        info.mac = Some(mac.clone());
    }
}
