//! Scheduled jobs and their execution history

use super::{json_column, parse_column, Database, ExecutionStatus, JobExecution, NewJob, ScheduledJob};
use crate::{WatchError, WatchResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const JOB_COLUMNS: &str = "id, name, ranges, method, params, cron, enabled, last_run_at, created_at, updated_at";
const EXECUTION_COLUMNS: &str =
    "id, job_id, started_at, finished_at, status, online_count, new_count, offline_count, output, error";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let ranges: String = row.get(2)?;
    let method: String = row.get(3)?;
    let params: String = row.get(4)?;
    Ok(ScheduledJob {
        id: row.get(0)?,
        name: row.get(1)?,
        ranges: json_column(2, &ranges)?,
        method: parse_column(3, &method)?,
        params: json_column(4, &params)?,
        cron: row.get(5)?,
        enabled: row.get(6)?,
        last_run_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<JobExecution> {
    let status: String = row.get(4)?;
    Ok(JobExecution {
        id: row.get(0)?,
        job_id: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: parse_column(4, &status)?,
        online_count: row.get::<_, i64>(5)? as u64,
        new_count: row.get::<_, i64>(6)? as u64,
        offline_count: row.get::<_, i64>(7)? as u64,
        output: row.get(8)?,
        error: row.get(9)?,
    })
}

impl Database {
    pub fn create_job(&self, job: &NewJob) -> WatchResult<ScheduledJob> {
        let now = Utc::now();
        let id = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO scheduled_jobs (name, ranges, method, params, cron, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    job.name,
                    serde_json::to_string(&job.ranges)?,
                    job.method.as_str(),
                    serde_json::to_string(&job.params)?,
                    job.cron,
                    job.enabled,
                    now,
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.require_job(id)
    }

    pub fn get_job(&self, id: i64) -> WatchResult<Option<ScheduledJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM scheduled_jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Like [`Database::get_job`] but a missing job is an error
    pub fn require_job(&self, id: i64) -> WatchResult<ScheduledJob> {
        self.get_job(id)?
            .ok_or_else(|| WatchError::NotFound(format!("job {}", id)))
    }

    pub fn list_jobs(&self) -> WatchResult<Vec<ScheduledJob>> {
        self.query_jobs("1 = 1")
    }

    pub fn list_enabled_jobs(&self) -> WatchResult<Vec<ScheduledJob>> {
        self.query_jobs("enabled = 1")
    }

    fn query_jobs(&self, filter: &str) -> WatchResult<Vec<ScheduledJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduled_jobs WHERE {} ORDER BY id",
            JOB_COLUMNS, filter
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Persist every editable field of `job` and bump `updated_at`
    pub fn save_job(&self, job: &ScheduledJob) -> WatchResult<ScheduledJob> {
        {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE scheduled_jobs SET name = ?2, ranges = ?3, method = ?4, params = ?5,
                    cron = ?6, enabled = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    job.id,
                    job.name,
                    serde_json::to_string(&job.ranges)?,
                    job.method.as_str(),
                    serde_json::to_string(&job.params)?,
                    job.cron,
                    job.enabled,
                    Utc::now(),
                ],
            )?;
            if changed == 0 {
                return Err(WatchError::NotFound(format!("job {}", job.id)));
            }
        }
        self.require_job(job.id)
    }

    pub fn delete_job(&self, id: i64) -> WatchResult<bool> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM job_executions WHERE job_id = ?1", params![id])?;
        let changed = conn.execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn touch_job_last_run(&self, id: i64, at: DateTime<Utc>) -> WatchResult<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE scheduled_jobs SET last_run_at = ?2 WHERE id = ?1", params![id, at])?;
        Ok(())
    }

    /// Open a `running` execution record and return its id
    pub fn start_execution(&self, job_id: i64, started_at: DateTime<Utc>) -> WatchResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO job_executions (job_id, started_at, status) VALUES (?1, ?2, ?3)",
            params![job_id, started_at, ExecutionStatus::Running.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Write the terminal state of an execution
    pub fn finish_execution(&self, execution: &JobExecution) -> WatchResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE job_executions SET finished_at = ?2, status = ?3, online_count = ?4,
                new_count = ?5, offline_count = ?6, output = ?7, error = ?8
             WHERE id = ?1",
            params![
                execution.id,
                execution.finished_at,
                execution.status.as_str(),
                execution.online_count as i64,
                execution.new_count as i64,
                execution.offline_count as i64,
                execution.output,
                execution.error,
            ],
        )?;
        Ok(())
    }

    /// Most recent executions of a job, newest first
    pub fn executions(&self, job_id: i64, limit: usize) -> WatchResult<Vec<JobExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_executions WHERE job_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
            EXECUTION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![job_id, limit as i64], execution_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Method;
    use crate::store::JobParams;

    fn new_job(name: &str, method: Method) -> NewJob {
        NewJob {
            name: name.to_string(),
            ranges: vec!["192.168.1.0/24".to_string()],
            method,
            params: JobParams { nmap_args: Some("-sn -PR".into()), duration_secs: None },
            cron: "*/10 * * * *".to_string(),
            enabled: true,
        }
    }

    #[test]
    fn test_job_crud() {
        let db = Database::in_memory().unwrap();
        let job = db.create_job(&new_job("office", Method::CliTool)).unwrap();
        assert_eq!(job.ranges, vec!["192.168.1.0/24".to_string()]);
        assert_eq!(job.params.nmap_args.as_deref(), Some("-sn -PR"));

        let mut edited = job.clone();
        edited.enabled = false;
        let saved = db.save_job(&edited).unwrap();
        assert!(!saved.enabled);
        assert!(saved.updated_at >= job.updated_at);

        assert!(db.list_enabled_jobs().unwrap().is_empty());
        assert_eq!(db.list_jobs().unwrap().len(), 1);
        assert!(db.delete_job(job.id).unwrap());
        assert!(matches!(db.require_job(job.id), Err(WatchError::NotFound(_))));
    }

    #[test]
    fn test_execution_history_newest_first() {
        let db = Database::in_memory().unwrap();
        let job = db.create_job(&new_job("office", Method::CliTool)).unwrap();
        let t0 = Utc::now();

        let first = db.start_execution(job.id, t0).unwrap();
        let second = db.start_execution(job.id, t0 + chrono::Duration::seconds(60)).unwrap();
        db.finish_execution(&JobExecution {
            id: first,
            job_id: job.id,
            started_at: t0,
            finished_at: Some(t0 + chrono::Duration::seconds(3)),
            status: ExecutionStatus::Success,
            online_count: 4,
            new_count: 1,
            offline_count: 0,
            output: Some("done".into()),
            error: None,
        })
        .unwrap();

        let history = db.executions(job.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second);
        assert_eq!(history[0].status, ExecutionStatus::Running);
        assert_eq!(history[1].status, ExecutionStatus::Success);
        assert_eq!(history[1].online_count, 4);
    }
}
