//! lanwatch - LAN inventory scan orchestrator
//!
//! Drives nmap sweeps and a recon REST service on a schedule, keeps a
//! device registry with per-method liveness, and controls ARP bans through
//! the same service.

pub mod config;
pub mod discovery;
pub mod disruption;
pub mod error;
pub mod monitor;
pub mod recon;
pub mod reconcile;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::{DaemonConfig, ProbeMode, ReconSettings};
pub use discovery::{parse_nmap_output, HostInfo, Method, Observations};
pub use disruption::{DisruptionController, ProtectionPolicy, TargetAdmin};
pub use error::{RetryPolicy, WatchError, WatchResult};
pub use monitor::{JournalKind, MonitorExit, MonitorRegistry};
pub use recon::{ClientPool, ClientProvider, ReconApi, Role};
pub use reconcile::{ReconcileStats, Reconciler};
pub use runner::{ScanRequest, ScanRunner};
pub use scheduler::{Scheduler, SchedulerStatus};
pub use store::Database;
