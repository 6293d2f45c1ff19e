//! IPv4 range expansion
//!
//! Ranges are written in prefix notation (`192.168.1.0/24`); host bits may be
//! set and are ignored. A bare address is treated as a /32.

use crate::{WatchError, WatchResult};
use ipnetwork::{IpNetwork, Ipv4Network};
use std::net::Ipv4Addr;

/// Parse a single range expression
pub fn parse_range(range: &str) -> WatchResult<Ipv4Network> {
    let trimmed = range.trim();
    if trimmed.is_empty() {
        return Err(WatchError::InvalidRange("empty range".to_string()));
    }

    match trimmed.parse::<IpNetwork>()? {
        IpNetwork::V4(net) => Ok(net),
        IpNetwork::V6(_) => Err(WatchError::InvalidRange(format!(
            "{}: only IPv4 ranges are supported",
            trimmed
        ))),
    }
}

/// Parse every range, failing on the first malformed one
pub fn parse_ranges<S: AsRef<str>>(ranges: &[S]) -> WatchResult<Vec<Ipv4Network>> {
    ranges.iter().map(|r| parse_range(r.as_ref())).collect()
}

/// Host addresses of a range in ascending order.
///
/// Network and broadcast addresses are excluded. A /31 yields both of its
/// addresses and a /32 its single address, since neither has a separate
/// network or broadcast address.
pub fn expand_range(range: &str) -> WatchResult<Vec<Ipv4Addr>> {
    let net = parse_range(range)?;
    Ok(host_bounds(net).map(Ipv4Addr::from).collect())
}

/// Addresses offered as disruption candidates: the range's hosts minus the
/// `.1` and `.254` host octets conventionally held by routers.
pub fn candidate_addresses(range: &str) -> WatchResult<Vec<Ipv4Addr>> {
    Ok(expand_range(range)?
        .into_iter()
        .filter(|ip| !matches!(ip.octets()[3], 1 | 254))
        .collect())
}

/// Whether `ip` falls inside any of `ranges`
pub fn in_any(ranges: &[Ipv4Network], ip: Ipv4Addr) -> bool {
    ranges.iter().any(|net| net.contains(ip))
}

/// Whether `ip` is one of the host addresses [`expand_range`] would yield
/// for any of `ranges`
pub fn is_host_of_any(ranges: &[Ipv4Network], ip: Ipv4Addr) -> bool {
    let value = u32::from(ip);
    ranges.iter().any(|net| host_bounds(*net).contains(&value))
}

/// Number of distinct host addresses across `ranges`, without enumerating
pub fn host_count(ranges: &[Ipv4Network]) -> u64 {
    let mut bounds: Vec<(u64, u64)> = ranges
        .iter()
        .map(|net| {
            let hosts = host_bounds(*net);
            (*hosts.start() as u64, *hosts.end() as u64)
        })
        .collect();
    bounds.sort_unstable();

    let mut total = 0;
    let mut covered: Option<(u64, u64)> = None;
    for (start, end) in bounds {
        covered = match covered {
            Some((lo, hi)) if start <= hi + 1 => Some((lo, hi.max(end))),
            Some((lo, hi)) => {
                total += hi - lo + 1;
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((lo, hi)) = covered {
        total += hi - lo + 1;
    }
    total
}

/// First and last host address of `net` as integers
fn host_bounds(net: Ipv4Network) -> std::ops::RangeInclusive<u32> {
    let base = u32::from(net.network());
    let last = u32::from(net.broadcast());

    match net.prefix() {
        32 | 31 => base..=last,
        _ => base + 1..=last - 1,
    }
}
