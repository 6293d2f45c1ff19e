//! Local network facts: gateway and local address for the disruption
//! protection policy, interface MACs for the scanning host itself

use log::debug;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;
use tokio::process::Command;

const IP_ADDR_TIMEOUT: Duration = Duration::from_secs(2);

/// Address of the default gateway, if one can be found.
///
/// Reads `ip route show default` and falls back to `route -n`.
pub async fn detect_gateway() -> Option<Ipv4Addr> {
    if let Ok(output) = Command::new("ip").args(["route", "show", "default"]).output().await {
        if let Some(gw) = parse_ip_route(&String::from_utf8_lossy(&output.stdout)) {
            return Some(gw);
        }
    }

    match Command::new("route").arg("-n").output().await {
        Ok(output) => parse_route_table(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!("gateway detection failed: {}", e);
            None
        }
    }
}

/// Primary local IPv4 address, found by routing a UDP socket outward.
/// No packet is sent.
pub fn detect_local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// The /24 network around `ip`, e.g. `192.168.1.0/24`
pub fn local_slash24(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{}.{}.{}.0/24", a, b, c)
}

/// `default via 192.168.1.1 dev eth0 ...`
pub fn parse_ip_route(text: &str) -> Option<Ipv4Addr> {
    text.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "via")?;
        tokens.next()?.parse().ok()
    })
}

/// Kernel routing table as printed by `route -n`; the gateway column of
/// the `0.0.0.0` destination row.
pub fn parse_route_table(text: &str) -> Option<Ipv4Addr> {
    text.lines().find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        match cols.as_slice() {
            ["0.0.0.0", gw, ..] => gw.parse().ok().filter(|ip: &Ipv4Addr| !ip.is_unspecified()),
            _ => None,
        }
    })
}

/// MAC address of every local interface carrying an IPv4 address, from
/// `ip addr show`. Empty when the command is unavailable.
pub async fn local_interface_macs() -> HashMap<Ipv4Addr, String> {
    let output = tokio::time::timeout(IP_ADDR_TIMEOUT, Command::new("ip").args(["addr", "show"]).output()).await;
    match output {
        Ok(Ok(output)) if output.status.success() => parse_ip_addr(&String::from_utf8_lossy(&output.stdout)),
        Ok(Ok(output)) => {
            debug!("ip addr show exited with {}", output.status);
            HashMap::new()
        }
        Ok(Err(e)) => {
            debug!("interface lookup failed: {}", e);
            HashMap::new()
        }
        Err(_) => {
            debug!("interface lookup timed out");
            HashMap::new()
        }
    }
}

/// Map each `inet` address to the `link/ether` MAC of its interface block
pub fn parse_ip_addr(text: &str) -> HashMap<Ipv4Addr, String> {
    let mut macs = HashMap::new();
    let mut current_mac: Option<String> = None;

    for line in text.lines() {
        // interface headers start at column 0: `2: eth0: <...>`
        if !line.starts_with(char::is_whitespace) {
            current_mac = None;
            continue;
        }

        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("link/ether") => current_mac = tokens.next().map(str::to_ascii_uppercase),
            Some("inet") => {
                let addr = tokens.next().and_then(|cidr| cidr.split('/').next());
                if let (Some(ip), Some(mac)) = (addr.and_then(|a| a.parse().ok()), current_mac.as_ref()) {
                    macs.insert(ip, mac.clone());
                }
            }
            _ => {}
        }
    }
    macs
}

/// Vendor of well-known virtual NIC prefixes
pub fn virtual_nic_vendor(mac: &str) -> Option<&'static str> {
    let prefix = mac.get(..8)?.to_ascii_uppercase();
    match prefix.as_str() {
        "00:0C:29" | "00:50:56" => Some("VMware"),
        "08:00:27" => Some("VirtualBox"),
        _ => None,
    }
}
