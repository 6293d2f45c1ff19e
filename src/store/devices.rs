//! Device registry queries

use super::{parse_column, Database, Device, Liveness};
use crate::discovery::{HostInfo, Method};
use crate::WatchResult;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::net::Ipv4Addr;

const DEVICE_COLUMNS: &str = "id, ip, mac, hostname, vendor, os, tags, note, first_seen, \
     cli_last_seen, cli_offline_at, rest_last_seen, rest_offline_at";

/// What an observation did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Refreshed,
    Created,
    /// Unknown address without MAC or hostname
    Skipped,
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let ip: String = row.get(1)?;
    Ok(Device {
        id: row.get(0)?,
        ip: parse_column(1, &ip)?,
        mac: row.get(2)?,
        hostname: row.get(3)?,
        vendor: row.get(4)?,
        os: row.get(5)?,
        tags: row.get(6)?,
        note: row.get(7)?,
        first_seen: row.get(8)?,
        cli: Liveness {
            last_seen: row.get(9)?,
            offline_at: row.get(10)?,
        },
        rest: Liveness {
            last_seen: row.get(11)?,
            offline_at: row.get(12)?,
        },
    })
}

impl Database {
    /// All devices ordered by address
    pub fn list_devices(&self) -> WatchResult<Vec<Device>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM devices", DEVICE_COLUMNS))?;
        let mut devices = stmt
            .query_map([], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        devices.sort_by_key(|d| d.ip);
        Ok(devices)
    }

    pub fn device_by_ip(&self, ip: Ipv4Addr) -> WatchResult<Option<Device>> {
        let conn = self.lock()?;
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE ip = ?1", DEVICE_COLUMNS),
                params![ip.to_string()],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    /// Record that `method` saw `ip` at `now`.
    ///
    /// Provided fields overwrite stored ones, missing fields leave them
    /// alone. The method's offline stamp is cleared. Unknown addresses are
    /// only inserted when the observation has a MAC or hostname.
    pub fn upsert_observation(
        &self,
        ip: Ipv4Addr,
        info: &HostInfo,
        method: Method,
        now: DateTime<Utc>,
    ) -> WatchResult<Upsert> {
        let prefix = method.column_prefix();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let refreshed = tx.execute(
            &format!(
                "UPDATE devices SET
                    mac = COALESCE(?2, mac),
                    hostname = COALESCE(?3, hostname),
                    vendor = COALESCE(?4, vendor),
                    os = COALESCE(?5, os),
                    {p}_last_seen = ?6,
                    {p}_offline_at = NULL
                 WHERE ip = ?1",
                p = prefix
            ),
            params![ip.to_string(), info.mac, info.hostname, info.vendor, info.os, now],
        )?;

        let outcome = if refreshed > 0 {
            Upsert::Refreshed
        } else if info.has_identity() {
            tx.execute(
                &format!(
                    "INSERT INTO devices (ip, mac, hostname, vendor, os, first_seen, {p}_last_seen)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    p = prefix
                ),
                params![ip.to_string(), info.mac, info.hostname, info.vendor, info.os, now],
            )?;
            Upsert::Created
        } else {
            Upsert::Skipped
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Stamp `method`'s offline time unless it is already set.
    /// Returns whether a stamp was written.
    pub fn stamp_offline(&self, ip: Ipv4Addr, method: Method, now: DateTime<Utc>) -> WatchResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            &format!(
                "UPDATE devices SET {p}_offline_at = ?2 WHERE ip = ?1 AND {p}_offline_at IS NULL",
                p = method.column_prefix()
            ),
            params![ip.to_string(), now],
        )?;
        Ok(changed > 0)
    }

    /// Set free-text tags and note
    pub fn annotate_device(&self, ip: Ipv4Addr, tags: Option<&str>, note: Option<&str>) -> WatchResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE devices SET tags = COALESCE(?2, tags), note = COALESCE(?3, note) WHERE ip = ?1",
            params![ip.to_string(), tags, note],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_device(&self, ip: Ipv4Addr) -> WatchResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM devices WHERE ip = ?1", params![ip.to_string()])?;
        Ok(changed > 0)
    }
}
