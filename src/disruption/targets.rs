//! Persistent target list in front of the controller

use super::{DisruptionController, DisruptionStatus, StartReport};
use crate::store::{BanAction, BanLogEntry, BanTarget, Database};
use crate::utils::cidr;
use crate::{WatchError, WatchResult};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// One address offered for targeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub ip: Ipv4Addr,
    pub protected: bool,
    pub targeted: bool,
}

/// Validates and stores targets and keeps the controller in sync
pub struct TargetAdmin {
    db: Database,
    controller: Arc<DisruptionController>,
}

impl TargetAdmin {
    pub fn new(db: Database, controller: Arc<DisruptionController>) -> Self {
        Self { db, controller }
    }

    pub fn controller(&self) -> &Arc<DisruptionController> {
        &self.controller
    }

    pub fn targets(&self) -> WatchResult<Vec<BanTarget>> {
        self.db.ban_targets()
    }

    fn target_ips(&self) -> WatchResult<Vec<Ipv4Addr>> {
        Ok(self.db.ban_targets()?.into_iter().map(|t| t.ip).collect())
    }

    /// Add a target; protected addresses and duplicates are rejected
    pub async fn add(&self, ip: Ipv4Addr, note: Option<&str>) -> WatchResult<BanTarget> {
        if let Some(reason) = self.controller.policy().reason(ip) {
            return Err(WatchError::Validation(format!("{} is protected ({})", ip, reason)));
        }
        let target = self.db.add_ban_target(ip, note)?;
        self.log(BanAction::Add, &[ip], note);
        self.push().await?;
        Ok(target)
    }

    pub async fn remove(&self, ip: Ipv4Addr) -> WatchResult<()> {
        if !self.db.remove_ban_target(ip)? {
            return Err(WatchError::NotFound(format!("target {}", ip)));
        }
        self.log(BanAction::Remove, &[ip], None);
        self.push().await
    }

    /// Hand the stored list to the controller (live when running)
    async fn push(&self) -> WatchResult<()> {
        let ips = self.target_ips()?;
        let running = self.controller.is_running().await;
        self.controller.set_targets(&ips).await?;
        if running {
            self.log(BanAction::Update, &ips, None);
        }
        Ok(())
    }

    pub async fn start(&self) -> WatchResult<StartReport> {
        let ips = self.target_ips()?;
        self.controller.set_targets(&ips).await?;
        let report = self.controller.start().await?;
        self.log(BanAction::Start, &report.targets, None);
        Ok(report)
    }

    pub async fn stop(&self) -> WatchResult<()> {
        let status = self.controller.status().await;
        let result = self.controller.stop().await;
        let detail = result.as_ref().err().map(|e| e.to_string());
        self.log(BanAction::Stop, &status.targets, detail.as_deref());
        result
    }

    /// Controller state, after adopting the service's view when reachable
    pub async fn status(&self) -> WatchResult<DisruptionStatus> {
        let ips = self.target_ips()?;
        self.controller.adopt_targets(&ips).await;
        match self.controller.refresh().await {
            Ok(_) => {}
            Err(e) if e.is_tool_error() || matches!(e, WatchError::NotConfigured) => {
                warn!("Could not read ban state from the recon service: {}", e);
            }
            Err(e) => return Err(e),
        }
        Ok(self.controller.status().await)
    }

    /// Hosts of `range` a user may pick from
    pub fn candidates(&self, range: &str) -> WatchResult<Vec<Candidate>> {
        let targeted: HashSet<Ipv4Addr> = self.target_ips()?.into_iter().collect();
        let policy = self.controller.policy();
        Ok(cidr::candidate_addresses(range)?
            .into_iter()
            .map(|ip| Candidate {
                ip,
                protected: policy.reason(ip).is_some(),
                targeted: targeted.contains(&ip),
            })
            .collect())
    }

    pub fn history(&self, limit: usize) -> WatchResult<Vec<BanLogEntry>> {
        self.db.ban_log(limit)
    }

    fn log(&self, action: BanAction, ips: &[Ipv4Addr], detail: Option<&str>) {
        info!("Ban {}: {:?}", action, ips);
        if let Err(e) = self.db.log_ban_action(action, ips, detail) {
            warn!("Failed to log ban action: {}", e);
        }
    }
}
