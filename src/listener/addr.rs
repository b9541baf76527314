//! Peer-address parsing for the guest listeners.
//!
//! Only the exact forms `vsock:<cid>`, `vsock:<cid>:<port>`, and
//! `ipv4:<a.b.c.d>:<port>` are accepted; anything else fails the RPC with
//! `FAILED_PRECONDITION`.

use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddress {
    Vsock { cid: u32, port: Option<u32> },
    Ipv4 { addr: Ipv4Addr, port: u16 },
}

/// Strict decimal parse: digits only, no sign, no surrounding junk.
fn parse_number<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub fn parse_peer_address(peer: &str) -> Option<PeerAddress> {
    if let Some(rest) = peer.strip_prefix("vsock:") {
        let mut parts = rest.split(':');
        let cid = parse_number(parts.next()?)?;
        let port = match parts.next() {
            Some(p) => Some(parse_number(p)?),
            None => None,
        };
        if parts.next().is_some() {
            return None;
        }
        return Some(PeerAddress::Vsock { cid, port });
    }

    if let Some(rest) = peer.strip_prefix("ipv4:") {
        let (addr, port) = rest.rsplit_once(':')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let port: u16 = parse_number(port)?;
        return Some(PeerAddress::Ipv4 { addr, port });
    }

    None
}
