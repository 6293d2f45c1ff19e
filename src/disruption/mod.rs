//! ARP ban control through the recon service
//!
//! The controller owns the running flag and the target list pushed to the
//! service. Protection of the gateway and of this host is advisory: the
//! service gets no whitelist, so protected addresses are kept off the list
//! by [`TargetAdmin`] before they reach the controller.

pub mod targets;

pub use targets::{Candidate, TargetAdmin};

use crate::recon::{ClientProvider, ReconApi, Role};
use crate::utils::network;
use crate::{WatchError, WatchResult};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Addresses that should never be disrupted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtectionPolicy {
    pub gateway: Option<Ipv4Addr>,
    pub local_ip: Option<Ipv4Addr>,
    pub extra: Vec<Ipv4Addr>,
}

impl ProtectionPolicy {
    /// Detect gateway and local address; `gateway` overrides detection
    pub async fn detect(gateway: Option<Ipv4Addr>, extra: Vec<Ipv4Addr>) -> Self {
        let gateway = match gateway {
            Some(gw) => Some(gw),
            None => network::detect_gateway().await,
        };
        let local_ip = network::detect_local_ip();
        info!("Protected addresses: gateway {:?}, local {:?}, extra {:?}", gateway, local_ip, extra);
        Self { gateway, local_ip, extra }
    }

    pub fn protected(&self) -> BTreeSet<Ipv4Addr> {
        self.gateway
            .into_iter()
            .chain(self.local_ip)
            .chain(self.extra.iter().copied())
            .collect()
    }

    /// Why `ip` is protected, if it is
    pub fn reason(&self, ip: Ipv4Addr) -> Option<&'static str> {
        if self.gateway == Some(ip) {
            Some("gateway")
        } else if self.local_ip == Some(ip) {
            Some("this host")
        } else if self.extra.contains(&ip) {
            Some("protected")
        } else {
            None
        }
    }
}

/// Returned by a successful start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub targets: Vec<Ipv4Addr>,
    /// Informational only; not sent to the service
    pub protected: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisruptionStatus {
    pub running: bool,
    pub targets: Vec<Ipv4Addr>,
    pub protected: Vec<Ipv4Addr>,
}

#[derive(Debug, Default)]
struct BanState {
    running: bool,
    targets: Vec<Ipv4Addr>,
}

fn targets_command(targets: &[Ipv4Addr]) -> String {
    if targets.is_empty() {
        return "set arp.spoof.targets \"\"".to_string();
    }
    let list: Vec<String> = targets.iter().map(Ipv4Addr::to_string).collect();
    format!("set arp.spoof.targets {}", list.join(","))
}

/// Process-wide ban state; construct one per service instance
pub struct DisruptionController {
    clients: Arc<dyn ClientProvider>,
    policy: ProtectionPolicy,
    state: Mutex<BanState>,
}

impl DisruptionController {
    pub fn new(clients: Arc<dyn ClientProvider>, policy: ProtectionPolicy) -> Self {
        Self {
            clients,
            policy,
            state: Mutex::new(BanState::default()),
        }
    }

    pub fn policy(&self) -> &ProtectionPolicy {
        &self.policy
    }

    async fn client(&self) -> WatchResult<Arc<dyn ReconApi>> {
        self.clients.settings()?;
        self.clients.client(Role::Ban).await
    }

    /// Replace the target list, pushing it to the service when running.
    ///
    /// An empty list while running clears the service's targets but leaves
    /// the ban running; only [`DisruptionController::stop`] ends it.
    pub async fn set_targets(&self, targets: &[Ipv4Addr]) -> WatchResult<()> {
        let mut state = self.state.lock().await;
        state.targets = dedup(targets);
        if !state.running {
            return Ok(());
        }

        let client = self.client().await?;
        client.run_command(&targets_command(&state.targets)).await?;
        if state.targets.is_empty() {
            warn!("Ban target list cleared while running; ban stays on");
        } else {
            info!("Ban targets updated live: {} addresses", state.targets.len());
        }
        Ok(())
    }

    /// Replace the cached list without contacting the service
    pub async fn adopt_targets(&self, targets: &[Ipv4Addr]) {
        self.state.lock().await.targets = dedup(targets);
    }

    /// Push the target list and switch the ban on
    pub async fn start(&self) -> WatchResult<StartReport> {
        let mut state = self.state.lock().await;
        if state.targets.is_empty() {
            return Err(WatchError::NoTargets);
        }
        let client = self.client().await?;

        let started = async {
            client.run_command(&targets_command(&state.targets)).await?;
            client.run_command("arp.ban on").await
        }
        .await;

        if let Err(e) = started {
            state.running = false;
            warn!("Failed to start ARP ban: {}", e);
            return Err(e);
        }

        state.running = true;
        info!("ARP ban started against {} targets", state.targets.len());
        Ok(StartReport {
            targets: state.targets.clone(),
            protected: self.policy.protected().into_iter().collect(),
        })
    }

    /// Switch the ban off and clear the service's targets.
    ///
    /// The running flag ends up false whatever happens; the first failure,
    /// if any, is returned after both commands were attempted.
    pub async fn stop(&self) -> WatchResult<()> {
        let mut state = self.state.lock().await;
        state.running = false;

        let client = self.client().await?;
        let mut first_error = None;
        for command in ["arp.ban off", "set arp.spoof.targets \"\""] {
            if let Err(e) = client.run_command(command).await {
                warn!("'{}' failed while stopping ban: {}", command, e);
                first_error.get_or_insert(e);
            }
        }
        info!("ARP ban stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Adopt the service's actual module state, e.g. after a restart of
    /// this process while a ban was left running
    pub async fn refresh(&self) -> WatchResult<bool> {
        let client = self.client().await?;
        let running = client.session().await?.is_running("arp.ban");
        self.state.lock().await.running = running;
        Ok(running)
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn status(&self) -> DisruptionStatus {
        let state = self.state.lock().await;
        DisruptionStatus {
            running: state.running,
            targets: state.targets.clone(),
            protected: self.policy.protected().into_iter().collect(),
        }
    }
}

fn dedup(targets: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut seen = BTreeSet::new();
    targets.iter().copied().filter(|ip| seen.insert(*ip)).collect()
}
