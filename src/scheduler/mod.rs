//! Recurrence scheduler
//!
//! Keeps one trigger per enabled job: a cron task for nmap jobs, a
//! continuous monitor for recon jobs. Administrative job changes go through
//! here so the single-enabled-recon-job rule is checked before anything is
//! persisted.

pub mod executor;
pub mod lock;
pub mod recurrence;

pub use executor::JobExecutor;
pub use lock::{probe_lock, SchedulerLock};
pub use recurrence::{validate_cron, Recurrence};

use crate::config::{DaemonConfig, ReconSettings};
use crate::discovery::Method;
use crate::monitor::{JournalKind, MonitorRegistry};
use crate::recon::ClientProvider;
use crate::runner::ScanRunner;
use crate::store::{Database, JobExecution, JobUpdate, NewEvent, NewJob, ScheduledJob};
use crate::utils::cidr;
use crate::{WatchError, WatchResult};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HOUSEKEEPING_CRON: &str = "0 0 3 * * *";

/// Snapshot of what the scheduler is doing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    /// Whether this process started the scheduler
    pub running: bool,
    /// Whether this process holds the singleton lock
    pub owns_lock: bool,
    /// Jobs with a live trigger or monitor
    pub active_job_ids: Vec<i64>,
    /// Jobs with a firing in progress
    pub running_job_ids: Vec<i64>,
    /// Recon jobs whose monitor task is alive
    pub monitor_job_ids: Vec<i64>,
}

struct CronTrigger {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CronTrigger {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

struct Registration {
    updated_at: DateTime<Utc>,
    trigger: Option<CronTrigger>,
}

/// Owns job triggers for this process
pub struct Scheduler {
    db: Database,
    clients: Arc<dyn ClientProvider>,
    monitors: Arc<MonitorRegistry>,
    executor: JobExecutor,
    lock_path: PathBuf,
    retention_days: i64,
    lock: StdMutex<Option<SchedulerLock>>,
    started: AtomicBool,
    registrations: Mutex<HashMap<i64, Registration>>,
    housekeeping: Mutex<Option<CronTrigger>>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        runner: ScanRunner,
        monitors: Arc<MonitorRegistry>,
        clients: Arc<dyn ClientProvider>,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            executor: JobExecutor::new(db.clone(), runner),
            db,
            clients,
            monitors,
            lock_path: config.lock_path.clone(),
            retention_days: config.event_retention_days,
            lock: StdMutex::new(None),
            started: AtomicBool::new(false),
            registrations: Mutex::new(HashMap::new()),
            housekeeping: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Take the singleton lock and register every enabled job.
    ///
    /// Returns false, without starting anything, when another process
    /// already owns the scheduler.
    pub async fn start(&self) -> WatchResult<bool> {
        if self.is_started() {
            return Ok(true);
        }

        let Some(lock) = SchedulerLock::try_acquire(&self.lock_path)? else {
            warn!("Another process owns the scheduler lock {}; not starting", self.lock_path.display());
            return Ok(false);
        };
        *self.lock.lock().unwrap_or_else(|e| e.into_inner()) = Some(lock);
        self.started.store(true, Ordering::SeqCst);

        self.sync_from_store().await?;
        self.start_housekeeping().await?;

        let active = self.registrations.lock().await.len();
        info!("Scheduler started with {} active jobs", active);
        self.record(
            NewEvent::new("scheduler_started", "scheduler", format!("Scheduler started with {} jobs", active))
                .with_details(json!({ "pid": std::process::id() })),
        );
        Ok(true)
    }

    /// Stop all triggers and monitors and release the lock
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(trigger) = self.housekeeping.lock().await.take() {
            trigger.stop();
        }
        for (_, registration) in self.registrations.lock().await.drain() {
            if let Some(trigger) = registration.trigger {
                trigger.stop();
            }
        }
        self.monitors.stop_all().await;

        self.record(NewEvent::new("scheduler_stopped", "scheduler", "Scheduler stopped"));
        self.lock.lock().unwrap_or_else(|e| e.into_inner()).take();
        info!("Scheduler stopped");
    }

    pub async fn status(&self) -> SchedulerStatus {
        let mut active_job_ids: Vec<i64> = self.registrations.lock().await.keys().copied().collect();
        active_job_ids.sort_unstable();
        let monitor_job_ids = self.monitors.active_ids().await;
        let owns_lock = self.lock.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        SchedulerStatus {
            running: self.is_started(),
            owns_lock,
            active_job_ids,
            running_job_ids: self.executor.running_ids(),
            monitor_job_ids,
        }
    }

    /// (Re)register the trigger for `job` according to its method
    pub async fn schedule(&self, job: &ScheduledJob) -> WatchResult<()> {
        if !job.enabled {
            self.unschedule(job.id).await;
            return Ok(());
        }

        let mut registrations = self.registrations.lock().await;
        if let Some(previous) = registrations.remove(&job.id) {
            if let Some(trigger) = previous.trigger {
                trigger.stop();
            }
        }

        let trigger = match job.method {
            Method::RestTool => {
                self.monitors.start(job).await?;
                None
            }
            Method::CliTool => {
                self.monitors.stop(job.id).await;
                let recurrence = Recurrence::parse(&job.cron)?;
                Some(self.spawn_cron(job.id, recurrence))
            }
        };

        debug!("Scheduled job {} ({}, {})", job.id, job.method, job.cron);
        registrations.insert(
            job.id,
            Registration {
                updated_at: job.updated_at,
                trigger,
            },
        );
        Ok(())
    }

    /// Remove any trigger or monitor for `job_id`
    pub async fn unschedule(&self, job_id: i64) {
        if let Some(registration) = self.registrations.lock().await.remove(&job_id) {
            if let Some(trigger) = registration.trigger {
                trigger.stop();
            }
        }
        if self.monitors.stop(job_id).await {
            debug!("Stopped monitor for job {}", job_id);
        }
    }

    /// Bring registrations in line with the enabled jobs in the store.
    ///
    /// Jobs are compared by `updated_at`, so edits made by another process
    /// are picked up. A monitor that gave up is not restarted until its job
    /// changes.
    pub async fn sync_from_store(&self) -> WatchResult<()> {
        let enabled = self.db.list_enabled_jobs()?;
        let known: HashMap<i64, DateTime<Utc>> = self
            .registrations
            .lock()
            .await
            .iter()
            .map(|(id, r)| (*id, r.updated_at))
            .collect();

        for (id, _) in known.iter().filter(|(id, _)| !enabled.iter().any(|j| j.id == **id)) {
            info!("Job {} no longer enabled, unscheduling", id);
            self.unschedule(*id).await;
        }

        for job in &enabled {
            if known.get(&job.id) == Some(&job.updated_at) {
                continue;
            }
            if let Err(e) = self.schedule(job).await {
                error!("Failed to schedule job {} ({}): {}", job.id, job.name, e);
            }
        }
        Ok(())
    }

    fn spawn_cron(&self, job_id: i64, recurrence: Recurrence) -> CronTrigger {
        let cancel = CancellationToken::new();
        let executor = self.executor.clone();
        let handle = tokio::spawn(cron_loop(recurrence, cancel.clone(), move || {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor.execute(job_id).await;
            });
        }));
        CronTrigger { cancel, handle }
    }

    async fn start_housekeeping(&self) -> WatchResult<()> {
        let recurrence = Recurrence::parse(HOUSEKEEPING_CRON)?;
        let db = self.db.clone();
        let retention_days = self.retention_days;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(cron_loop(recurrence, cancel.clone(), move || {
            if let Err(e) = cleanup_events(&db, retention_days) {
                error!("Event cleanup failed: {}", e);
            }
        }));
        *self.housekeeping.lock().await = Some(CronTrigger { cancel, handle });
        Ok(())
    }

    /// Delete system events past the retention window
    pub fn cleanup_events(&self) -> WatchResult<usize> {
        cleanup_events(&self.db, self.retention_days)
    }

    // administrative operations

    fn validate_job(&self, job: &ScheduledJob) -> WatchResult<()> {
        if job.name.trim().is_empty() {
            return Err(WatchError::Validation("job name must not be empty".to_string()));
        }
        if job.ranges.is_empty() {
            return Err(WatchError::Validation("job needs at least one range".to_string()));
        }
        cidr::parse_ranges(&job.ranges)?;
        validate_cron(&job.cron)?;

        if job.method == Method::RestTool && job.enabled {
            self.clients.settings()?;
        }
        self.ensure_single_recon_job(job)
    }

    /// Only one recon job may be enabled at a time
    pub fn ensure_single_recon_job(&self, job: &ScheduledJob) -> WatchResult<()> {
        if job.method != Method::RestTool || !job.enabled {
            return Ok(());
        }
        match self
            .db
            .list_enabled_jobs()?
            .into_iter()
            .find(|other| other.method == Method::RestTool && other.id != job.id)
        {
            Some(other) => Err(WatchError::SchedulingConflict {
                job_id: other.id,
                name: other.name,
            }),
            None => Ok(()),
        }
    }

    pub async fn create_job(&self, new: NewJob) -> WatchResult<ScheduledJob> {
        let now = Utc::now();
        let draft = ScheduledJob {
            id: 0,
            name: new.name.trim().to_string(),
            ranges: new.ranges.clone(),
            method: new.method,
            params: new.params.clone(),
            cron: new.cron.trim().to_string(),
            enabled: new.enabled,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        self.validate_job(&draft)?;

        let job = self.db.create_job(&NewJob {
            name: draft.name,
            cron: draft.cron,
            ..new
        })?;
        info!("Created job {} ({})", job.id, job.name);
        self.apply(&job).await;
        Ok(job)
    }

    pub async fn update_job(&self, id: i64, update: JobUpdate) -> WatchResult<ScheduledJob> {
        let current = self.db.require_job(id)?;
        let next = update.apply_to(&current);
        self.validate_job(&next)?;

        let job = self.db.save_job(&next)?;
        info!("Updated job {} ({})", job.id, job.name);
        self.apply(&job).await;
        Ok(job)
    }

    /// Flip `enabled`
    pub async fn toggle_job(&self, id: i64) -> WatchResult<ScheduledJob> {
        let current = self.db.require_job(id)?;
        self.update_job(
            id,
            JobUpdate {
                enabled: Some(!current.enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete_job(&self, id: i64) -> WatchResult<()> {
        self.unschedule(id).await;
        if !self.db.delete_job(id)? {
            return Err(WatchError::NotFound(format!("job {}", id)));
        }
        info!("Deleted job {}", id);
        Ok(())
    }

    /// Fire an nmap job now on a background task
    pub fn trigger_job(&self, id: i64) -> WatchResult<()> {
        self.check_triggerable(id)?;
        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor.execute(id).await;
        });
        Ok(())
    }

    /// Fire an nmap job now and wait for it
    pub async fn run_job_now(&self, id: i64) -> WatchResult<Option<JobExecution>> {
        self.check_triggerable(id)?;
        Ok(self.executor.execute(id).await)
    }

    fn check_triggerable(&self, id: i64) -> WatchResult<ScheduledJob> {
        let job = self.db.require_job(id)?;
        if job.method == Method::RestTool {
            return Err(WatchError::Validation(format!(
                "job {} runs continuously; enable or disable it instead",
                id
            )));
        }
        if !job.enabled {
            return Err(WatchError::Validation(format!("job {} is disabled", id)));
        }
        Ok(job)
    }

    async fn apply(&self, job: &ScheduledJob) {
        if !self.is_started() {
            return;
        }
        if let Err(e) = self.schedule(job).await {
            error!("Failed to schedule job {} ({}): {}", job.id, job.name, e);
        }
    }

    /// Log lines for a job: the monitor journal for recon jobs, the last
    /// execution for nmap jobs
    pub fn job_logs(&self, id: i64, kind: JournalKind) -> WatchResult<Vec<String>> {
        let job = self.db.require_job(id)?;
        if job.method == Method::RestTool {
            return Ok(self.monitors.logs(id, kind));
        }
        Ok(self
            .db
            .executions(id, 1)?
            .first()
            .map(render_execution)
            .unwrap_or_default())
    }

    /// Persist new recon settings and restart the monitors that use them
    pub async fn apply_recon_settings(&self, settings: &ReconSettings) -> WatchResult<()> {
        settings.validate()?;
        self.db.save_recon_settings(settings)?;
        self.clients.invalidate().await;

        let mut restarted = Vec::new();
        if self.is_started() {
            for job in self.db.list_enabled_jobs()? {
                if job.method != Method::RestTool {
                    continue;
                }
                match self.schedule(&job).await {
                    Ok(()) => restarted.push(job.id),
                    Err(e) => error!("Failed to restart job {}: {}", job.id, e),
                }
            }
        }

        self.record(
            NewEvent::new("recon_settings_updated", "config", "Recon connection settings updated").with_details(
                json!({
                    "scan_url": settings.scan_url,
                    "ban_url": settings.ban_url,
                    "probe_mode": settings.probe_mode.as_str(),
                    "restarted_jobs": restarted,
                }),
            ),
        );
        Ok(())
    }

    fn record(&self, event: NewEvent) {
        if let Err(e) = self.db.record_event(&event) {
            warn!("Failed to record system event: {}", e);
        }
    }
}

/// Sleep until each firing of `recurrence` and call `fire`
async fn cron_loop<F>(recurrence: Recurrence, cancel: CancellationToken, mut fire: F)
where
    F: FnMut() + Send + 'static,
{
    loop {
        let now = Local::now();
        let Some(next) = recurrence.next_after(&now) else {
            warn!("Cron '{}' has no future firings", recurrence.expr());
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => fire(),
        }
    }
}

fn cleanup_events(db: &Database, retention_days: i64) -> WatchResult<usize> {
    let cutoff = Utc::now() - ChronoDuration::days(retention_days);
    let removed = db.purge_events_before(cutoff)?;
    if removed > 0 {
        info!("Removed {} system events older than {} days", removed, retention_days);
        db.record_event(
            &NewEvent::new(
                "events_cleanup",
                "maintenance",
                format!("Removed {} events older than {} days", removed, retention_days),
            )
            .with_details(json!({ "removed": removed, "retention_days": retention_days })),
        )?;
    }
    Ok(removed)
}

fn render_execution(execution: &JobExecution) -> Vec<String> {
    let mut lines = vec![format!(
        "execution {} started {} status {}",
        execution.id,
        execution.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        execution.status
    )];
    lines.push(format!(
        "online {} new {} offline {}",
        execution.online_count, execution.new_count, execution.offline_count
    ));
    if let Some(error) = &execution.error {
        lines.push(format!("error: {}", error));
    }
    if let Some(output) = &execution.output {
        lines.extend(output.lines().map(String::from));
    }
    lines
}
