//! Execution of recurring nmap jobs

use crate::discovery::Method;
use crate::error::truncate_message;
use crate::runner::ScanRunner;
use crate::store::{Database, ExecutionStatus, JobExecution};
use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Runs job firings, at most one per job id at a time
#[derive(Clone)]
pub struct JobExecutor {
    db: Database,
    runner: ScanRunner,
    in_progress: Arc<Mutex<HashSet<i64>>>,
}

/// Clears the in-progress mark when the firing ends, however it ends
struct InProgress {
    set: Arc<Mutex<HashSet<i64>>>,
    job_id: i64,
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.job_id);
    }
}

impl JobExecutor {
    pub fn new(db: Database, runner: ScanRunner) -> Self {
        Self {
            db,
            runner,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Job ids with a firing underway
    pub fn running_ids(&self) -> Vec<i64> {
        let set = self.in_progress.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<i64> = set.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn mark(&self, job_id: i64) -> Option<InProgress> {
        let mut set = self.in_progress.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(job_id).then(|| InProgress {
            set: Arc::clone(&self.in_progress),
            job_id,
        })
    }

    /// One firing of a job.
    ///
    /// Returns `None` without doing anything when the job is already
    /// running, was removed, is disabled, or is not an nmap job.
    pub async fn execute(&self, job_id: i64) -> Option<JobExecution> {
        let Some(_guard) = self.mark(job_id) else {
            info!("Job {} is still running, skipping this firing", job_id);
            return None;
        };

        let job = match self.db.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Job {} no longer exists", job_id);
                return None;
            }
            Err(e) => {
                error!("Failed to load job {}: {}", job_id, e);
                return None;
            }
        };
        if !job.enabled || job.method != Method::CliTool {
            warn!("Job {} is disabled or not an nmap job, not executing", job_id);
            return None;
        }

        let started_at = Utc::now();
        let id = match self.db.start_execution(job_id, started_at) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to open execution record for job {}: {}", job_id, e);
                return None;
            }
        };
        if let Err(e) = self.db.touch_job_last_run(job_id, started_at) {
            warn!("Failed to update last run of job {}: {}", job_id, e);
        }

        info!("Executing job {} ({}) on {}", job.id, job.name, job.ranges.join(", "));
        let limits = self.runner.settings();
        let mut execution = JobExecution {
            id,
            job_id,
            started_at,
            finished_at: None,
            status: ExecutionStatus::Running,
            online_count: 0,
            new_count: 0,
            offline_count: 0,
            output: None,
            error: None,
        };

        match self.runner.sweep(&job.ranges, &job.params).await {
            Ok(outcome) => {
                execution.status = ExecutionStatus::Success;
                execution.online_count = outcome.online;
                execution.new_count = outcome.stats.new;
                execution.offline_count = outcome.stats.offline;
                execution.output = Some(truncate_message(&outcome.output.stdout, limits.max_output_bytes));
                info!(
                    "Job {} finished: {} online, {} new, {} offline",
                    job.id, outcome.online, outcome.stats.new, outcome.stats.offline
                );
            }
            Err(e) => {
                error!("Job {} failed: {}", job.id, e);
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(truncate_message(&e.to_string(), limits.max_error_chars));
            }
        }

        execution.finished_at = Some(Utc::now());
        if let Err(e) = self.db.finish_execution(&execution) {
            error!("Failed to close execution {} of job {}: {}", id, job_id, e);
        }
        Some(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NmapSettings, RunnerSettings};
    use crate::discovery::NmapEngine;
    use crate::recon::ClientPool;
    use crate::store::{JobParams, NewJob};

    fn executor(db: &Database) -> JobExecutor {
        let runner = ScanRunner::new(
            db.clone(),
            Arc::new(NmapEngine::new(NmapSettings {
                binary: "/nonexistent/lanwatch-nmap".into(),
                ..Default::default()
            })),
            Arc::new(ClientPool::new(db.clone())),
            RunnerSettings::default(),
        );
        JobExecutor::new(db.clone(), runner)
    }

    fn job(db: &Database, method: Method) -> i64 {
        db.create_job(&NewJob {
            name: "sweep".into(),
            ranges: vec!["10.1.0.0/30".into()],
            method,
            params: JobParams::default(),
            cron: "*/5 * * * *".into(),
            enabled: true,
        })
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_failed_firing_is_recorded() {
        let db = Database::in_memory().unwrap();
        let exec = executor(&db);
        let id = job(&db, Method::CliTool);

        let execution = exec.execute(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.is_some());

        let history = db.executions(id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Failed);
        assert!(history[0].finished_at.is_some());
        assert!(db.require_job(id).unwrap().last_run_at.is_some());
        assert!(exec.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_firing_skipped() {
        let db = Database::in_memory().unwrap();
        let exec = executor(&db);
        let id = job(&db, Method::CliTool);

        let held = exec.mark(id).unwrap();
        assert_eq!(exec.running_ids(), vec![id]);
        assert!(exec.execute(id).await.is_none());
        assert!(db.executions(id, 10).unwrap().is_empty());

        drop(held);
        assert!(exec.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_recon_job_not_executed() {
        let db = Database::in_memory().unwrap();
        let exec = executor(&db);
        let id = job(&db, Method::RestTool);
        assert!(exec.execute(id).await.is_none());
        assert!(exec.execute(9999).await.is_none());
    }
}
