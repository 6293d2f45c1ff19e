//! Disruption target list and action log

use super::{json_column, parse_column, BanAction, BanLogEntry, BanTarget, Database};
use crate::{WatchError, WatchResult};
use chrono::Utc;
use rusqlite::{params, Row};
use std::net::Ipv4Addr;

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<BanTarget> {
    let ip: String = row.get(0)?;
    Ok(BanTarget {
        ip: parse_column(0, &ip)?,
        note: row.get(1)?,
        added_at: row.get(2)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<BanLogEntry> {
    let action: String = row.get(1)?;
    let targets: String = row.get(2)?;
    Ok(BanLogEntry {
        id: row.get(0)?,
        action: parse_column(1, &action)?,
        targets: json_column(2, &targets)?,
        detail: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl Database {
    /// Add an address to the target list; duplicates are rejected
    pub fn add_ban_target(&self, ip: Ipv4Addr, note: Option<&str>) -> WatchResult<BanTarget> {
        let conn = self.lock()?;
        let now = Utc::now();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO ban_targets (ip, note, added_at) VALUES (?1, ?2, ?3)",
            params![ip.to_string(), note, now],
        )?;
        if inserted == 0 {
            return Err(WatchError::Validation(format!("{} is already a target", ip)));
        }
        Ok(BanTarget {
            ip,
            note: note.map(String::from),
            added_at: now,
        })
    }

    pub fn remove_ban_target(&self, ip: Ipv4Addr) -> WatchResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM ban_targets WHERE ip = ?1", params![ip.to_string()])?;
        Ok(removed > 0)
    }

    /// Target list ordered by address
    pub fn ban_targets(&self) -> WatchResult<Vec<BanTarget>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT ip, note, added_at FROM ban_targets")?;
        let mut targets = stmt
            .query_map([], target_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        targets.sort_by_key(|t| t.ip);
        Ok(targets)
    }

    pub fn log_ban_action(&self, action: BanAction, targets: &[Ipv4Addr], detail: Option<&str>) -> WatchResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ban_log (action, targets, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![action.as_str(), serde_json::to_string(targets)?, detail, Utc::now()],
        )?;
        Ok(())
    }

    /// Newest log entries first
    pub fn ban_log(&self, limit: usize) -> WatchResult<Vec<BanLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, action, targets, detail, created_at FROM ban_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], log_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}
