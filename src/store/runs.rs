//! One-shot scan run records

use super::{json_column, parse_column, Database, ScanRun};
use crate::WatchResult;
use rusqlite::{params, OptionalExtension, Row};

const RUN_COLUMNS: &str = "token, ranges, method, params, status, progress, output, total_hosts, \
     online_count, new_count, offline_count, error, created_at, started_at, finished_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRun> {
    let ranges: String = row.get(1)?;
    let method: String = row.get(2)?;
    let params: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(ScanRun {
        token: row.get(0)?,
        ranges: json_column(1, &ranges)?,
        method: parse_column(2, &method)?,
        params: json_column(3, &params)?,
        status: parse_column(4, &status)?,
        progress: row.get::<_, i64>(5)?.clamp(0, 100) as u8,
        output: row.get(6)?,
        total_hosts: row.get::<_, i64>(7)? as u64,
        online_count: row.get::<_, i64>(8)? as u64,
        new_count: row.get::<_, i64>(9)? as u64,
        offline_count: row.get::<_, i64>(10)? as u64,
        error: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        finished_at: row.get(14)?,
    })
}

impl Database {
    /// Insert or overwrite the whole run record
    pub fn save_run(&self, run: &ScanRun) -> WatchResult<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO scan_runs ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                RUN_COLUMNS
            ),
            params![
                run.token,
                serde_json::to_string(&run.ranges)?,
                run.method.as_str(),
                serde_json::to_string(&run.params)?,
                run.status.as_str(),
                run.progress as i64,
                run.output,
                run.total_hosts as i64,
                run.online_count as i64,
                run.new_count as i64,
                run.offline_count as i64,
                run.error,
                run.created_at,
                run.started_at,
                run.finished_at,
            ],
        )?;
        Ok(())
    }

    /// Cheap progress write used while a run streams output
    pub fn update_run_progress(&self, token: &str, progress: u8, output: &str) -> WatchResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE scan_runs SET progress = MAX(progress, ?2), output = ?3 WHERE token = ?1",
            params![token, progress as i64, output],
        )?;
        Ok(())
    }

    pub fn get_run(&self, token: &str) -> WatchResult<Option<ScanRun>> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM scan_runs WHERE token = ?1", RUN_COLUMNS),
                params![token],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Newest runs first
    pub fn recent_runs(&self, limit: usize) -> WatchResult<Vec<ScanRun>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scan_runs ORDER BY created_at DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![limit as i64], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}
