//! nmap text report parser
//!
//! A host only enters the result after nmap says it is up. Announcement lines
//! open a pending entry, "Host is up" commits it, and "[host down]" removes
//! it even if it was committed earlier in the same report. Detail lines
//! (MAC/vendor, OS) attach to the last committed host.

use super::{HostInfo, Observations};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;

static REPORT_WITH_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Nmap scan report for (.+?) \((\d+\.\d+\.\d+\.\d+)\)").expect("valid regex")
});
static REPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Nmap scan report for (\d+\.\d+\.\d+\.\d+)").expect("valid regex"));
static MAC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^MAC Address: ([0-9A-Fa-f:]{17})(?: \((.+?)\))?").expect("valid regex")
});
static OS_DETAILS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^OS details: (.+)").expect("valid regex"));
static RUNNING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Running: (.+)").expect("valid regex"));

const HOST_UP: &str = "Host is up";
const HOST_DOWN: &str = "[host down]";

#[derive(Debug)]
enum Cursor {
    /// Announced, waiting for confirmation
    Pending { ip: Ipv4Addr, hostname: Option<String> },
    /// Confirmed up; details attach here
    Confirmed { ip: Ipv4Addr, os_detail: bool },
}

/// Parse a full nmap report into the hosts it confirmed up.
pub fn parse_nmap_output(text: &str) -> Observations {
    let mut results = Observations::new();
    let mut cursor: Option<Cursor> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some((ip, hostname)) = parse_announcement(line) {
            if line.contains(HOST_DOWN) {
                results.remove(&ip);
                cursor = None;
            } else {
                cursor = Some(Cursor::Pending { ip, hostname });
            }
            continue;
        }

        if line.contains(HOST_DOWN) {
            if let Some(ip) = cursor_ip(&cursor) {
                results.remove(&ip);
            }
            cursor = None;
            continue;
        }

        if line.starts_with(HOST_UP) {
            if let Some(Cursor::Pending { ip, hostname }) = &cursor {
                let ip = *ip;
                let entry = results.entry(ip).or_default();
                if hostname.is_some() {
                    entry.hostname = hostname.clone();
                }
                cursor = Some(Cursor::Confirmed { ip, os_detail: false });
            }
            continue;
        }

        if let Some(Cursor::Confirmed { ip, os_detail }) = cursor.as_mut() {
            if let Some(entry) = results.get_mut(&*ip) {
                apply_detail(entry, os_detail, line);
            }
        }
    }

    results
}

fn parse_announcement(line: &str) -> Option<(Ipv4Addr, Option<String>)> {
    if let Some(caps) = REPORT_WITH_NAME.captures(line) {
        let ip = caps.get(2)?.as_str().parse().ok()?;
        let hostname = caps.get(1).map(|m| m.as_str().to_string());
        return Some((ip, hostname));
    }

    let caps = REPORT.captures(line)?;
    let ip = caps.get(1)?.as_str().parse().ok()?;
    Some((ip, None))
}

fn cursor_ip(cursor: &Option<Cursor>) -> Option<Ipv4Addr> {
    match cursor {
        Some(Cursor::Pending { ip, .. }) | Some(Cursor::Confirmed { ip, .. }) => Some(*ip),
        None => None,
    }
}

fn apply_detail(entry: &mut HostInfo, os_detail: &mut bool, line: &str) {
    if let Some(caps) = MAC.captures(line) {
        entry.mac = caps.get(1).map(|m| m.as_str().to_ascii_uppercase());
        entry.vendor = caps.get(2).map(|m| m.as_str().to_string());
        return;
    }

    if let Some(caps) = OS_DETAILS.captures(line) {
        // first detail line wins, and overrides a coarser Running: guess
        if !*os_detail {
            entry.os = caps.get(1).map(|m| m.as_str().to_string());
            *os_detail = true;
        }
        return;
    }

    if let Some(caps) = RUNNING.captures(line) {
        if entry.os.is_none() {
            entry.os = caps.get(1).map(|m| m.as_str().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_single_host_with_mac_and_vendor() {
        let text = "Nmap scan report for 10.0.0.5\nHost is up\nMAC Address: AA:BB:CC:DD:EE:FF (Acme)\n";
        let result = parse_nmap_output(text);

        assert_eq!(result.len(), 1);
        let info = &result[&ip("10.0.0.5")];
        assert_eq!(info.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(info.vendor.as_deref(), Some("Acme"));
        assert_eq!(info.hostname, None);
        assert_eq!(info.os, None);
    }

    #[test]
    fn test_host_down_yields_nothing() {
        assert!(parse_nmap_output("Nmap scan report for 10.0.0.6\n[host down]\n").is_empty());
        assert!(parse_nmap_output("Nmap scan report for 10.0.0.6 [host down]\n").is_empty());
    }

    #[test]
    fn test_unconfirmed_host_is_dropped_even_with_details() {
        let text = "Nmap scan report for printer.lan (10.0.0.7)\n\
MAC Address: 11:22:33:44:55:66 (Brother)\n\
Nmap scan report for 10.0.0.8\n\
Host is up (0.0010s latency).\n";
        let result = parse_nmap_output(text);

        assert_eq!(result.keys().copied().collect::<Vec<_>>(), vec![ip("10.0.0.8")]);
        assert_eq!(result[&ip("10.0.0.8")].mac, None);
    }

    #[test]
    fn test_flapping_host_removed() {
        let text = "Nmap scan report for 10.0.0.9\nHost is up.\n\
Nmap scan report for 10.0.0.10\nHost is up.\n\
Nmap scan report for 10.0.0.9\n[host down]\n";
        let result = parse_nmap_output(text);

        assert!(!result.contains_key(&ip("10.0.0.9")));
        assert!(result.contains_key(&ip("10.0.0.10")));
    }

    #[test]
    fn test_hostname_lowercase_mac_and_os_preference() {
        let text = "Nmap scan report for nas.home (192.168.1.20)\n\
Host is up (0.00050s latency).\n\
MAC Address: 0a:1b:2c:3d:4e:5f (Synology)\n\
Running: Linux 4.X\n\
OS details: Linux 4.15 - 5.6\n\
OS details: something else\n";
        let result = parse_nmap_output(text);
        let info = &result[&ip("192.168.1.20")];

        assert_eq!(info.hostname.as_deref(), Some("nas.home"));
        assert_eq!(info.mac.as_deref(), Some("0A:1B:2C:3D:4E:5F"));
        assert_eq!(info.os.as_deref(), Some("Linux 4.15 - 5.6"));
    }

    #[test]
    fn test_running_is_fallback() {
        let text = "Nmap scan report for 10.0.0.11\nHost is up.\nRunning: Microsoft Windows 10\n";
        let result = parse_nmap_output(text);
        assert_eq!(result[&ip("10.0.0.11")].os.as_deref(), Some("Microsoft Windows 10"));
    }

    #[test]
    fn test_parse_is_idempotent() {
        let text = "Starting Nmap 7.94\n\
Nmap scan report for router (192.168.1.1)\nHost is up (0.002s latency).\n\
MAC Address: 00:11:22:33:44:55 (Netgear)\n\
Nmap scan report for 192.168.1.30\nHost is up.\n\
Nmap done: 256 IP addresses (2 hosts up) scanned in 2.10 seconds\n";
        assert_eq!(parse_nmap_output(text), parse_nmap_output(text));
        assert_eq!(parse_nmap_output(text).len(), 2);
    }
}
