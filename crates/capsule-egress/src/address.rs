//! Address-class checks.
//!
//! Literal hosts are classified before any DNS lookup or allowlist match.
//! Resolved addresses go through the same classification so a permitted
//! hostname cannot point the proxy at internal infrastructure.

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Why a target address is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Localhost,
    Ipv6Literal,
    PrivateAddress,
    LoopbackAddress,
    LinkLocalAddress,
    CgnatAddress,
    UnspecifiedAddress,
    /// Multicast, broadcast, documentation and other reserved space.
    ReservedAddress,
}

impl BlockReason {
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::Localhost => "localhost",
            BlockReason::Ipv6Literal => "ipv6_literal",
            BlockReason::PrivateAddress => "private_address",
            BlockReason::LoopbackAddress => "loopback_address",
            BlockReason::LinkLocalAddress => "link_local_address",
            BlockReason::CgnatAddress => "cgnat_address",
            BlockReason::UnspecifiedAddress => "unspecified_address",
            BlockReason::ReservedAddress => "reserved_address",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Check a URL hostname in its literal form.
pub fn check_host(host: &str) -> Result<(), BlockReason> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return Err(BlockReason::Localhost);
    }
    if host.starts_with('[') || host.contains(':') {
        return Err(BlockReason::Ipv6Literal);
    }
    if let Some(ip) = parse_ipv4_literal(&host) {
        return classify_ipv4(ip).map_or(Ok(()), Err);
    }
    Ok(())
}

/// Dotted-quad literal. Shorthand and numeric forms (`127.1`, `2130706433`)
/// are normalized by URL parsing before they get here.
fn parse_ipv4_literal(host: &str) -> Option<Ipv4Addr> {
    host.parse().ok()
}

pub fn classify_ipv4(ip: Ipv4Addr) -> Option<BlockReason> {
    let [a, b, ..] = ip.octets();
    if ip.is_unspecified() || a == 0 {
        Some(BlockReason::UnspecifiedAddress)
    } else if ip.is_loopback() {
        Some(BlockReason::LoopbackAddress)
    } else if ip.is_private() {
        Some(BlockReason::PrivateAddress)
    } else if ip.is_link_local() {
        Some(BlockReason::LinkLocalAddress)
    } else if a == 100 && (64..128).contains(&b) {
        Some(BlockReason::CgnatAddress)
    } else if ip.is_broadcast() || ip.is_multicast() || ip.is_documentation() || a >= 240 {
        Some(BlockReason::ReservedAddress)
    } else {
        None
    }
}

pub fn classify_ipv6(ip: Ipv6Addr) -> Option<BlockReason> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_ipv4(v4);
    }
    let first = ip.segments()[0];
    if ip.is_unspecified() {
        Some(BlockReason::UnspecifiedAddress)
    } else if ip.is_loopback() {
        Some(BlockReason::LoopbackAddress)
    } else if first & 0xfe00 == 0xfc00 {
        Some(BlockReason::PrivateAddress)
    } else if first & 0xffc0 == 0xfe80 {
        Some(BlockReason::LinkLocalAddress)
    } else if ip.is_multicast() {
        Some(BlockReason::ReservedAddress)
    } else {
        None
    }
}

/// Classify a resolved address.
pub fn classify_ip(ip: IpAddr) -> Option<BlockReason> {
    match ip {
        IpAddr::V4(v4) => classify_ipv4(v4),
        IpAddr::V6(v6) => classify_ipv6(v6),
    }
}
