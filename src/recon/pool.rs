//! Shared recon clients, one per role
//!
//! Discovery and disruption talk to separate service instances. Each role
//! gets one client that is reused until the stored connection settings
//! change or the pool is invalidated. Construction happens under a single
//! async lock so concurrent callers never build duplicates.

use super::{HttpReconClient, ReconApi};
use crate::config::ReconSettings;
use crate::store::Database;
use crate::{WatchError, WatchResult};
use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Which service instance a client talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Scan,
    Ban,
}

impl Role {
    fn url<'a>(&self, settings: &'a ReconSettings) -> &'a str {
        match self {
            Role::Scan => &settings.scan_url,
            Role::Ban => &settings.ban_url,
        }
    }
}

/// Source of recon clients and their settings
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Current connection settings; `NotConfigured` when absent
    fn settings(&self) -> WatchResult<ReconSettings>;

    /// Client for `role`, created on first use
    async fn client(&self, role: Role) -> WatchResult<Arc<dyn ReconApi>>;

    /// Drop cached clients so the next call rebuilds them
    async fn invalidate(&self);
}

struct Slot {
    fingerprint: String,
    client: Arc<dyn ReconApi>,
}

/// Store-backed [`ClientProvider`]
pub struct ClientPool {
    db: Database,
    slots: Mutex<HashMap<Role, Slot>>,
}

impl ClientPool {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            slots: Mutex::new(HashMap::new()),
        }
    }
}

fn fingerprint(url: &str, settings: &ReconSettings) -> String {
    format!("{}|{}|{}", url, settings.username, settings.password)
}

#[async_trait]
impl ClientProvider for ClientPool {
    fn settings(&self) -> WatchResult<ReconSettings> {
        self.db.recon_settings()?.ok_or(WatchError::NotConfigured)
    }

    async fn client(&self, role: Role) -> WatchResult<Arc<dyn ReconApi>> {
        let mut slots = self.slots.lock().await;
        let settings = self.settings()?;
        let url = role.url(&settings);
        let current = fingerprint(url, &settings);

        if let Some(slot) = slots.get(&role) {
            if slot.fingerprint == current {
                return Ok(Arc::clone(&slot.client));
            }
        }

        info!("Creating {:?} recon client for {}", role, url);
        let client: Arc<dyn ReconApi> =
            Arc::new(HttpReconClient::new(url, &settings.username, &settings.password)?);
        slots.insert(
            role,
            Slot {
                fingerprint: current,
                client: Arc::clone(&client),
            },
        );
        Ok(client)
    }

    async fn invalidate(&self) {
        self.slots.lock().await.clear();
    }
}
