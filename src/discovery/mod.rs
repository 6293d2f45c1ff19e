//! Host discovery: what a scan observed and how it was observed
//!
//! Two independent mechanisms feed the device registry. The nmap sweep runs
//! as a subprocess and its text report is parsed here; the recon service is
//! queried over HTTP (see [`crate::recon`]). Each mechanism keeps its own
//! liveness columns on a device, so the [`Method`] travels with every batch.

pub mod nmap;
pub mod parser;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::WatchError;

pub use nmap::{NmapEngine, NmapOutput};
pub use parser::parse_nmap_output;

/// Discovery mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// nmap host discovery subprocess
    #[serde(rename = "cli-tool")]
    CliTool,
    /// recon REST service
    #[serde(rename = "rest-tool")]
    RestTool,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::CliTool => "cli-tool",
            Method::RestTool => "rest-tool",
        }
    }

    /// Column prefix of this method's liveness pair in the devices table
    pub(crate) fn column_prefix(&self) -> &'static str {
        match self {
            Method::CliTool => "cli",
            Method::RestTool => "rest",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cli-tool" | "cli" | "nmap" => Ok(Method::CliTool),
            "rest-tool" | "rest" | "bettercap" => Ok(Method::RestTool),
            other => Err(WatchError::Validation(format!("unknown scan method '{}'", other))),
        }
    }
}

/// What one scan learned about one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os: Option<String>,
}

impl HostInfo {
    /// New devices are only created from observations carrying a MAC or hostname
    pub fn has_identity(&self) -> bool {
        self.mac.is_some() || self.hostname.is_some()
    }
}

/// Confirmed hosts of one scan, keyed and ordered by address
pub type Observations = BTreeMap<Ipv4Addr, HostInfo>;
