//! Client IP derivation and allowlist matching
//!
//! The client address is taken from `X-Forwarded-For` (first hop), then
//! `X-Real-IP`, then the socket peer address. Allowlist entries are exact
//! addresses or CIDR blocks, IPv6-aware; IPv4-mapped IPv6 addresses are
//! compared against their embedded IPv4 form.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use axum::http::HeaderMap;
use ipnet::IpNet;

/// Derive the client IP for allowlist checks
///
/// Returns `None` when no candidate parses as an IP address.
pub fn derive_client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            if let Some(ip) = parse_ip(first) {
                return Some(ip);
            }
        }
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        if let Some(ip) = parse_ip(real_ip) {
            return Some(ip);
        }
    }

    remote.map(|addr| normalize(addr.ip()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    IpAddr::from_str(raw.trim()).ok().map(normalize)
}

/// Unmap IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d` -> `a.b.c.d`)
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Validate allowlist entries
///
/// Every entry must parse as a CIDR block or an exact IP address. Run at
/// boot so a typo fails startup instead of silently denying all traffic
/// for that credential.
pub fn validate_allowlist(allowlist: &[String]) -> Result<(), String> {
    for entry in allowlist {
        let entry = entry.trim();
        if IpNet::from_str(entry).is_err() && IpAddr::from_str(entry).is_err() {
            return Err(format!(
                "allowlist entry {entry:?} is neither a CIDR block nor an IP address"
            ));
        }
    }
    Ok(())
}

/// Whether `ip` matches any allowlist entry (exact address or CIDR)
///
/// Unparseable entries are skipped; an allowlist of only unparseable
/// entries therefore matches nothing.
pub fn ip_allowed(ip: IpAddr, allowlist: &[String]) -> bool {
    let ip = normalize(ip);
    allowlist.iter().any(|entry| {
        let entry = entry.trim();
        if let Ok(net) = IpNet::from_str(entry) {
            return net.contains(&ip);
        }
        if let Ok(exact) = IpAddr::from_str(entry) {
            return normalize(exact) == ip;
        }
        false
    })
}
