//! System event log

use super::{json_column, parse_column, Database, NewEvent, SystemEvent};
use crate::WatchResult;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SystemEvent> {
    let details: Option<String> = row.get(4)?;
    let severity: String = row.get(5)?;
    Ok(SystemEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        category: row.get(2)?,
        message: row.get(3)?,
        details: details.map(|d| json_column(4, &d)).transpose()?,
        severity: parse_column(5, &severity)?,
        created_at: row.get(6)?,
    })
}

impl Database {
    pub fn record_event(&self, event: &NewEvent) -> WatchResult<i64> {
        let details = event.details.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO system_events (event_type, category, message, details, severity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_type,
                event.category,
                event.message,
                details,
                event.severity.as_str(),
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest events first
    pub fn recent_events(&self, limit: usize) -> WatchResult<Vec<SystemEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, category, message, details, severity, created_at
             FROM system_events ORDER BY id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Delete events created before `cutoff`, returning how many went
    pub fn purge_events_before(&self, cutoff: DateTime<Utc>) -> WatchResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM system_events WHERE created_at < ?1", params![cutoff])?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Severity;
    use serde_json::json;

    #[test]
    fn test_record_and_purge() {
        let db = Database::in_memory().unwrap();
        db.record_event(
            &NewEvent::new("recon_restart", "monitor", "restarted")
                .with_severity(Severity::Warning)
                .with_details(json!({"job_id": 1})),
        )
        .unwrap();
        db.record_event(&NewEvent::new("scheduler_started", "scheduler", "up")).unwrap();

        let events = db.recent_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "scheduler_started");
        assert_eq!(events[1].severity, Severity::Warning);
        assert_eq!(events[1].details, Some(json!({"job_id": 1})));

        assert_eq!(db.purge_events_before(Utc::now() - chrono::Duration::days(1)).unwrap(), 0);
        assert_eq!(db.purge_events_before(Utc::now() + chrono::Duration::seconds(1)).unwrap(), 2);
    }
}
