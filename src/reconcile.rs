//! Merge scan observations into the device registry
//!
//! Each method keeps its own `(last_seen, offline_at)` pair, so a device
//! that drops off the recon feed can still be online according to nmap.
//! Writes are per device; a failed write is logged and the batch goes on.

use crate::discovery::{HostInfo, Method, Observations};
use crate::store::{Database, Upsert};
use crate::utils::cidr;
use crate::WatchResult;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Counts produced by one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    /// Observed addresses written to the registry, new ones included
    pub updated: u64,
    /// Devices created by this pass
    pub new: u64,
    /// Devices newly stamped offline by this pass
    pub offline: u64,
}

/// Registry writer shared by runners and monitors
#[derive(Clone)]
pub struct Reconciler {
    db: Database,
}

impl Reconciler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply a full batch.
    ///
    /// With `mark_offline` and `expected` ranges, every known device at a
    /// host address of those ranges that this batch did not observe gets its
    /// offline stamp for `method`, unless it already has one.
    pub fn reconcile(
        &self,
        observations: &Observations,
        method: Method,
        mark_offline: bool,
        expected: Option<&[Ipv4Network]>,
    ) -> WatchResult<ReconcileStats> {
        let now = Utc::now();
        let mut stats = ReconcileStats::default();

        for (ip, info) in observations {
            match self.db.upsert_observation(*ip, info, method, now) {
                Ok(Upsert::Refreshed) => stats.updated += 1,
                Ok(Upsert::Created) => {
                    stats.updated += 1;
                    stats.new += 1;
                }
                Ok(Upsert::Skipped) => debug!("{} seen without MAC or hostname, not recorded", ip),
                Err(e) => warn!("Failed to record {} ({}): {}", ip, method, e),
            }
        }

        if let (true, Some(expected)) = (mark_offline, expected) {
            for device in self.db.list_devices()? {
                if !cidr::is_host_of_any(expected, device.ip) || observations.contains_key(&device.ip) {
                    continue;
                }
                if device.liveness(method).offline_at.is_some() {
                    continue;
                }
                match self.db.stamp_offline(device.ip, method, now) {
                    Ok(true) => stats.offline += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to mark {} offline ({}): {}", device.ip, method, e),
                }
            }
        }

        debug!(
            "Reconciled {} observations via {}: {:?}",
            observations.len(),
            method,
            stats
        );
        Ok(stats)
    }

    /// Single-device "appeared" update from a live event
    pub fn observe(&self, ip: Ipv4Addr, info: &HostInfo, method: Method) -> WatchResult<Upsert> {
        self.db.upsert_observation(ip, info, method, Utc::now())
    }

    /// Single-device "lost" update from a live event
    pub fn mark_lost(&self, ip: Ipv4Addr, method: Method) -> WatchResult<bool> {
        self.db.stamp_offline(ip, method, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> Ipv4Network {
        cidr::parse_range(s).unwrap()
    }

    fn with_mac(mac: &str) -> HostInfo {
        HostInfo { mac: Some(mac.to_string()), ..Default::default() }
    }

    #[test]
    fn test_new_plus_absent_expected() {
        let db = Database::in_memory().unwrap();
        let reconciler = Reconciler::new(db.clone());

        // a device known from before that will not be observed
        db.upsert_observation(ip("10.0.0.2"), &with_mac("02:00:00:00:00:02"), Method::CliTool, Utc::now())
            .unwrap();

        let mut obs = Observations::new();
        obs.insert(ip("10.0.0.1"), with_mac("02:00:00:00:00:01"));
        let expected = [net("10.0.0.0/30")];

        let stats = reconciler.reconcile(&obs, Method::CliTool, true, Some(&expected[..])).unwrap();
        assert_eq!(stats, ReconcileStats { updated: 1, new: 1, offline: 1 });
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let reconciler = Reconciler::new(db.clone());
        db.upsert_observation(ip("10.0.0.2"), &with_mac("02:00:00:00:00:02"), Method::CliTool, Utc::now())
            .unwrap();

        let mut obs = Observations::new();
        obs.insert(ip("10.0.0.1"), with_mac("02:00:00:00:00:01"));
        let expected = [net("10.0.0.0/30")];

        reconciler.reconcile(&obs, Method::CliTool, true, Some(&expected[..])).unwrap();
        let stamped = db.device_by_ip(ip("10.0.0.2")).unwrap().unwrap().cli.offline_at;

        let again = reconciler.reconcile(&obs, Method::CliTool, true, Some(&expected[..])).unwrap();
        assert_eq!(again, ReconcileStats { updated: 1, new: 0, offline: 0 });
        assert_eq!(db.device_by_ip(ip("10.0.0.2")).unwrap().unwrap().cli.offline_at, stamped);
    }

    #[test]
    fn test_methods_are_independent() {
        let db = Database::in_memory().unwrap();
        let reconciler = Reconciler::new(db.clone());
        let target = ip("10.0.0.5");
        db.upsert_observation(target, &with_mac("02:00:00:00:00:05"), Method::CliTool, Utc::now())
            .unwrap();
        db.upsert_observation(target, &HostInfo::default(), Method::RestTool, Utc::now())
            .unwrap();

        let expected = [net("10.0.0.5/32")];
        let stats = reconciler
            .reconcile(&Observations::new(), Method::RestTool, true, Some(&expected[..]))
            .unwrap();
        assert_eq!(stats.offline, 1);

        let device = db.device_by_ip(target).unwrap().unwrap();
        assert!(device.cli.is_online());
        assert!(!device.rest.is_online());
        assert!(device.is_online());
    }

    #[test]
    fn test_no_offline_marking_without_flag_or_universe() {
        let db = Database::in_memory().unwrap();
        let reconciler = Reconciler::new(db.clone());
        db.upsert_observation(ip("10.0.0.8"), &with_mac("02:00:00:00:00:08"), Method::CliTool, Utc::now())
            .unwrap();
        let expected = [net("10.0.0.0/24")];

        let empty = Observations::new();
        assert_eq!(reconciler.reconcile(&empty, Method::CliTool, false, Some(&expected[..])).unwrap().offline, 0);
        assert_eq!(reconciler.reconcile(&empty, Method::CliTool, true, None).unwrap().offline, 0);
    }

    #[test]
    fn test_unidentified_new_address_not_created() {
        let db = Database::in_memory().unwrap();
        let reconciler = Reconciler::new(db.clone());
        let mut obs = Observations::new();
        obs.insert(ip("10.0.0.9"), HostInfo::default());

        let stats = reconciler.reconcile(&obs, Method::CliTool, false, None).unwrap();
        assert_eq!(stats, ReconcileStats::default());
        assert!(db.list_devices().unwrap().is_empty());
    }
}
