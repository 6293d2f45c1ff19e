//! Recon REST service: command/response contract and event vocabulary
//!
//! The service is driven through session commands (`net.recon on`,
//! `set arp.spoof.targets ...`), exposes the hosts it currently knows, and
//! keeps a rolling event buffer that callers poll.

pub mod client;
pub mod pool;

use crate::discovery::HostInfo;
use crate::WatchResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub use client::HttpReconClient;
pub use pool::{ClientPool, ClientProvider, Role};

/// Operations the rest of the crate needs from the recon service
#[async_trait]
pub trait ReconApi: Send + Sync {
    /// Execute one session command
    async fn run_command(&self, cmd: &str) -> WatchResult<Value>;

    /// Hosts currently in the service's LAN table
    async fn lan_hosts(&self) -> WatchResult<Vec<Endpoint>>;

    /// Up to `limit` most recent events, newest first
    async fn events(&self, limit: usize) -> WatchResult<Vec<ReconEvent>>;

    /// Session state (module flags and environment)
    async fn session(&self) -> WatchResult<SessionInfo>;
}

/// Host entry as reported by the service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub ipv4: String,
    pub mac: String,
    pub hostname: String,
    pub vendor: String,
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Endpoint {
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ipv4.trim().parse().ok()
    }

    pub fn to_host_info(&self) -> HostInfo {
        HostInfo {
            mac: non_empty(&self.mac).map(|m| m.to_ascii_uppercase()),
            hostname: non_empty(&self.hostname),
            vendor: non_empty(&self.vendor),
            os: None,
        }
    }

    /// Best short label: hostname, then vendor, then MAC, then address
    pub fn label(&self) -> &str {
        [&self.hostname, &self.vendor, &self.mac]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .map(String::as_str)
            .unwrap_or(&self.ipv4)
    }
}

/// One entry of the event buffer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconEvent {
    pub id: Option<u64>,
    pub tag: String,
    pub time: String,
    pub data: Value,
}

/// What an event means for the registry
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    EndpointNew(Endpoint),
    EndpointLost(Endpoint),
    /// wifi.*, ble.*, hid.*
    Wireless,
    SysLog { level: String, message: String },
    Other,
}

impl ReconEvent {
    pub fn kind(&self) -> EventKind {
        match self.tag.as_str() {
            "endpoint.new" => EventKind::EndpointNew(self.endpoint()),
            "endpoint.lost" => EventKind::EndpointLost(self.endpoint()),
            "sys.log" => EventKind::SysLog {
                level: self.data_str("Level").unwrap_or_else(|| "inf".to_string()),
                message: self.data_str("Message").unwrap_or_default(),
            },
            tag if ["wifi.", "ble.", "hid."].iter().any(|p| tag.starts_with(p)) => EventKind::Wireless,
            _ => EventKind::Other,
        }
    }

    /// Endpoint payload; some builds nest it under `endpoint`
    fn endpoint(&self) -> Endpoint {
        let payload = self.data.get("endpoint").unwrap_or(&self.data);
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }

    fn data_str(&self, key: &str) -> Option<String> {
        self.data.get(key).and_then(Value::as_str).map(String::from)
    }

    /// `HH:MM:SS` part of an RFC 3339 timestamp, or the raw text
    pub fn clock(&self) -> &str {
        match self.time.split_once('T') {
            Some((_, rest)) => rest.split(['.', 'Z', '+']).next().unwrap_or(rest),
            None => &self.time,
        }
    }

    /// Line in the style of the service's own console
    pub fn raw_line(&self) -> String {
        let clock = self.clock();
        match self.kind() {
            EventKind::EndpointNew(ep) => {
                let mut line = format!("[{}] [sys.log] [inf] endpoint.new {}", clock, ep.ipv4);
                for part in [&ep.mac, &ep.hostname] {
                    if !part.is_empty() {
                        line.push(' ');
                        line.push_str(part);
                    }
                }
                if !ep.vendor.is_empty() {
                    line.push_str(&format!(" ({})", ep.vendor));
                }
                line
            }
            EventKind::EndpointLost(ep) if ep.mac.is_empty() => {
                format!("[{}] [sys.log] [inf] endpoint.lost {}", clock, ep.ipv4)
            }
            EventKind::EndpointLost(ep) => {
                format!("[{}] [sys.log] [inf] endpoint.lost {} {}", clock, ep.ipv4, ep.mac)
            }
            EventKind::SysLog { level, message } => format!("[{}] [sys.log] [{}] {}", clock, level, message),
            EventKind::Wireless => format!("[{}] [sys.log] [inf] {} {}", clock, self.tag, self.data),
            EventKind::Other => format!("[{}] [{}] {}", clock, self.tag, self.data),
        }
    }

    /// Short human-readable line
    pub fn friendly_line(&self) -> String {
        match self.kind() {
            EventKind::EndpointNew(ep) => format!("device online: {} ({})", ep.ipv4, ep.label()),
            EventKind::EndpointLost(ep) => format!("device offline: {} ({})", ep.ipv4, ep.label()),
            EventKind::SysLog { message, .. } => message,
            EventKind::Wireless | EventKind::Other => self.tag.clone(),
        }
    }
}

/// Module flags and environment of the current session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub modules: HashMap<String, bool>,
    pub env: HashMap<String, String>,
}

impl SessionInfo {
    /// Build from the service's session document, tolerating missing parts
    pub fn from_value(value: &Value) -> Self {
        let modules = value
            .get("modules")
            .and_then(Value::as_array)
            .map(|mods| {
                mods.iter()
                    .filter_map(|m| {
                        let name = m.get("name")?.as_str()?.to_string();
                        let running = m.get("running").and_then(Value::as_bool).unwrap_or(false);
                        Some((name, running))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let env = value
            .pointer("/env/data")
            .and_then(Value::as_object)
            .map(|data| {
                data.iter()
                    .map(|(k, v)| (k.clone(), v.as_str().map(String::from).unwrap_or_else(|| v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self { modules, env }
    }

    pub fn is_running(&self, module: &str) -> bool {
        self.modules.get(module).copied().unwrap_or(false)
    }

    /// "active", "passive" or "stopped", judged from running modules
    pub fn discovery_mode(&self) -> &'static str {
        match (self.is_running("net.recon"), self.is_running("net.probe")) {
            (_, true) => "active",
            (true, false) => "passive",
            (false, false) => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_conversion() {
        let ep: Endpoint = serde_json::from_value(json!({
            "ipv4": "192.168.1.40",
            "mac": "aa:bb:cc:00:11:22",
            "hostname": "",
            "vendor": "Apple",
            "alias": "phone"
        }))
        .unwrap();

        assert_eq!(ep.ip(), Some(Ipv4Addr::new(192, 168, 1, 40)));
        let info = ep.to_host_info();
        assert_eq!(info.mac.as_deref(), Some("AA:BB:CC:00:11:22"));
        assert_eq!(info.hostname, None);
        assert_eq!(info.vendor.as_deref(), Some("Apple"));
        assert_eq!(ep.label(), "Apple");
    }

    #[test]
    fn test_event_classification() {
        let new: ReconEvent = serde_json::from_value(json!({
            "tag": "endpoint.new",
            "time": "2024-05-01T10:11:12.123456+02:00",
            "data": {"ipv4": "10.0.0.3", "mac": "02:00:00:00:00:03", "hostname": "", "vendor": ""}
        }))
        .unwrap();
        assert!(matches!(new.kind(), EventKind::EndpointNew(ref ep) if ep.ipv4 == "10.0.0.3"));
        assert_eq!(new.clock(), "10:11:12");
        assert_eq!(new.raw_line(), "[10:11:12] [sys.log] [inf] endpoint.new 10.0.0.3 02:00:00:00:00:03");

        let nested: ReconEvent = serde_json::from_value(json!({
            "id": 7, "tag": "endpoint.lost", "data": {"endpoint": {"ipv4": "10.0.0.4"}}
        }))
        .unwrap();
        assert_eq!(nested.id, Some(7));
        assert!(matches!(nested.kind(), EventKind::EndpointLost(ref ep) if ep.ipv4 == "10.0.0.4"));

        let log: ReconEvent =
            serde_json::from_value(json!({"tag": "sys.log", "data": {"Level": "war", "Message": "hi"}})).unwrap();
        assert_eq!(log.kind(), EventKind::SysLog { level: "war".into(), message: "hi".into() });

        let wifi = ReconEvent { tag: "wifi.ap.new".into(), ..Default::default() };
        assert_eq!(wifi.kind(), EventKind::Wireless);
        let other = ReconEvent { tag: "mod.started".into(), ..Default::default() };
        assert_eq!(other.kind(), EventKind::Other);
    }

    #[test]
    fn test_session_info() {
        let session = SessionInfo::from_value(&json!({
            "modules": [
                {"name": "net.recon", "running": true},
                {"name": "net.probe", "running": false},
                {"name": "arp.ban", "running": true}
            ],
            "env": {"data": {"net.probe.throttle": "5"}}
        }));

        assert_eq!(session.discovery_mode(), "passive");
        assert!(session.is_running("arp.ban"));
        assert_eq!(session.env.get("net.probe.throttle").map(String::as_str), Some("5"));
        assert_eq!(SessionInfo::default().discovery_mode(), "stopped");
    }
}
