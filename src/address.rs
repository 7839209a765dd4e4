//! # Address Projection
//!
//! Helpers layered over [`multiaddr::Multiaddr`].
//!
//! The stack treats a multiaddress as an opaque component sequence and only
//! projects out what it needs: an optional host+port, the transport tag, an
//! optional trailing peer id, and a coarse reachability class used by the
//! dial ranker. Parsing and byte/string round-tripping are the `multiaddr`
//! crate's job.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use multiaddr::{Multiaddr, Protocol};

use crate::error::{Error, Result};
use crate::identity::PeerId;

/// Transport named by an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportTag {
    /// `/tcp/<port>`
    Tcp,
    /// `/udp/<port>`
    Udp,
    /// No known transport component
    Unknown,
}

/// Coarse reachability class of an address, used for dial ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// Loopback host
    Loopback,
    /// RFC1918 / unique-local / link-local host
    Private,
    /// Everything else
    Public,
}

/// The transport component of `addr`, if any
pub fn transport_tag(addr: &Multiaddr) -> TransportTag {
    for proto in addr.iter() {
        match proto {
            Protocol::Tcp(_) => return TransportTag::Tcp,
            Protocol::Udp(_) => return TransportTag::Udp,
            _ => {}
        }
    }
    TransportTag::Unknown
}

/// The IP host and port of `addr`, if both are present
pub fn host_port(addr: &Multiaddr) -> Option<(IpAddr, u16)> {
    let mut host = None;
    let mut port = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => host = host.or(Some(IpAddr::V4(ip))),
            Protocol::Ip6(ip) => host = host.or(Some(IpAddr::V6(ip))),
            Protocol::Tcp(p) | Protocol::Udp(p) => port = port.or(Some(p)),
            _ => {}
        }
    }
    Some((host?, port?))
}

/// Convert to a socket address when host and port are present
pub fn to_socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    host_port(addr).map(|(host, port)| SocketAddr::new(host, port))
}

/// Build a TCP multiaddress from a socket address
pub fn from_socket_addr(addr: SocketAddr) -> Multiaddr {
    let mut out = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => out.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => out.push(Protocol::Ip6(ip)),
    }
    out.push(Protocol::Tcp(addr.port()));
    out
}

/// The trailing `/p2p/<id>` component, if the address ends with one
pub fn peer_id(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(multihash)) => PeerId::from_multihash(multihash).ok(),
        _ => None,
    }
}

/// Split a trailing `/p2p/<id>` component off the address
pub fn split_peer_id(addr: &Multiaddr) -> (Multiaddr, Option<PeerId>) {
    match peer_id(addr) {
        Some(id) => {
            let mut base = addr.clone();
            base.pop();
            (base, Some(id))
        }
        None => (addr.clone(), None),
    }
}

/// Append `/p2p/<id>` to an address that does not already carry one
pub fn with_peer_id(addr: &Multiaddr, id: &PeerId) -> Multiaddr {
    match peer_id(addr) {
        Some(_) => addr.clone(),
        None => addr.clone().with(Protocol::P2p(*id.multihash())),
    }
}

/// Check the structural invariant that `/p2p/…` only appears as the final
/// component.
pub fn validate(addr: &Multiaddr) -> Result<()> {
    let count = addr.iter().count();
    for (index, proto) in addr.iter().enumerate() {
        if matches!(proto, Protocol::P2p(_)) && index + 1 != count {
            return Err(Error::InvalidAddress(format!(
                "/p2p component must be last in {addr}"
            )));
        }
    }
    Ok(())
}

/// True when the address routes through a relay (`/p2p-circuit`)
pub fn is_relay(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Classify the host of `addr` for dial ranking.
///
/// Addresses with no IP host (or relay addresses) classify as `Public`.
pub fn address_class(addr: &Multiaddr) -> AddressClass {
    match host_port(addr) {
        Some((IpAddr::V4(ip), _)) => classify_v4(ip),
        Some((IpAddr::V6(ip), _)) => classify_v6(ip),
        None => AddressClass::Public,
    }
}

fn classify_v4(ip: Ipv4Addr) -> AddressClass {
    if ip.is_loopback() {
        AddressClass::Loopback
    } else if ip.is_private() || ip.is_link_local() {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

fn classify_v6(ip: Ipv6Addr) -> AddressClass {
    if ip.is_loopback() {
        AddressClass::Loopback
    } else if is_v6_unique_local(ip) || is_v6_link_local(ip) {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

fn is_v6_unique_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// True for fe80::/10 link-local IPv6 addresses
pub fn is_v6_link_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

// ============================================================================
// ADDRESS INFO
// ============================================================================

/// A peer id together with the addresses it was seen at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    /// The peer the addresses belong to
    pub peer_id: PeerId,
    /// Transport addresses, without the trailing `/p2p` component
    pub addrs: Vec<Multiaddr>,
}

impl AddressInfo {
    /// Derive from a composite `/…/p2p/<id>` address
    pub fn from_multiaddr(addr: &Multiaddr) -> Result<AddressInfo> {
        validate(addr)?;
        let (base, id) = split_peer_id(addr);
        let peer_id = id.ok_or_else(|| {
            Error::InvalidAddress(format!("address {addr} carries no /p2p component"))
        })?;
        let addrs = if base.is_empty() { vec![] } else { vec![base] };
        Ok(AddressInfo { peer_id, addrs })
    }
}

impl fmt::Display for AddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ [", self.peer_id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{addr}")?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_string_bytes_roundtrip() {
        for text in [
            "/ip4/127.0.0.1/tcp/4001",
            "/ip6/::1/tcp/9",
            "/ip4/8.8.8.8/udp/53",
            "/ip6zone/eth0/ip6/fe80::1/tcp/80",
        ] {
            let parsed = addr(text);
            let from_bytes = Multiaddr::try_from(parsed.to_vec()).unwrap();
            assert_eq!(parsed, from_bytes);
            assert_eq!(parsed, addr(&parsed.to_string()));
        }
    }

    #[test]
    fn test_transport_tag() {
        assert_eq!(transport_tag(&addr("/ip4/1.2.3.4/tcp/1")), TransportTag::Tcp);
        assert_eq!(transport_tag(&addr("/ip4/1.2.3.4/udp/1")), TransportTag::Udp);
        assert_eq!(transport_tag(&addr("/ip4/1.2.3.4")), TransportTag::Unknown);
    }

    #[test]
    fn test_host_port_projection() {
        let (host, port) = host_port(&addr("/ip4/10.0.0.1/tcp/4001")).unwrap();
        assert_eq!(host, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(port, 4001);

        assert!(host_port(&addr("/ip4/10.0.0.1")).is_none());
    }

    #[test]
    fn test_socket_addr_roundtrip() {
        let sa: SocketAddr = "192.168.1.5:8080".parse().unwrap();
        let ma = from_socket_addr(sa);
        assert_eq!(ma, addr("/ip4/192.168.1.5/tcp/8080"));
        assert_eq!(to_socket_addr(&ma), Some(sa));
    }

    #[test]
    fn test_peer_id_split_and_append() {
        let id = Keypair::generate().peer_id();
        let base = addr("/ip4/127.0.0.1/tcp/4001");
        let full = with_peer_id(&base, &id);

        assert_eq!(peer_id(&full), Some(id));
        let (split_base, split_id) = split_peer_id(&full);
        assert_eq!(split_base, base);
        assert_eq!(split_id, Some(id));

        // Appending twice is a no-op
        assert_eq!(with_peer_id(&full, &id), full);
    }

    #[test]
    fn test_validate_requires_p2p_last() {
        let id = Keypair::generate().peer_id();
        let good = with_peer_id(&addr("/ip4/1.2.3.4/tcp/1"), &id);
        assert!(validate(&good).is_ok());

        let mut bad = Multiaddr::empty();
        bad.push(Protocol::P2p(*id.multihash()));
        bad.push(Protocol::Tcp(80));
        assert!(validate(&bad).is_err());
    }

    #[test]
    fn test_address_classes() {
        assert_eq!(address_class(&addr("/ip4/127.0.0.1/tcp/1")), AddressClass::Loopback);
        assert_eq!(address_class(&addr("/ip6/::1/tcp/1")), AddressClass::Loopback);
        assert_eq!(address_class(&addr("/ip4/192.168.0.9/tcp/1")), AddressClass::Private);
        assert_eq!(address_class(&addr("/ip4/169.254.0.1/tcp/1")), AddressClass::Private);
        assert_eq!(address_class(&addr("/ip6/fd00::1/tcp/1")), AddressClass::Private);
        assert_eq!(address_class(&addr("/ip4/8.8.8.8/tcp/1")), AddressClass::Public);
        assert_eq!(address_class(&addr("/ip6/2001:db8::1/tcp/1")), AddressClass::Public);
    }

    #[test]
    fn test_link_local_v6_detection() {
        assert!(is_v6_link_local("fe80::1".parse().unwrap()));
        assert!(!is_v6_link_local("fd00::1".parse().unwrap()));
        assert!(!is_v6_link_local("::1".parse().unwrap()));
    }

    #[test]
    fn test_address_info_from_composite() {
        let id = Keypair::generate().peer_id();
        let full = with_peer_id(&addr("/ip4/1.2.3.4/tcp/4001"), &id);

        let info = AddressInfo::from_multiaddr(&full).unwrap();
        assert_eq!(info.peer_id, id);
        assert_eq!(info.addrs, vec![addr("/ip4/1.2.3.4/tcp/4001")]);

        assert!(AddressInfo::from_multiaddr(&addr("/ip4/1.2.3.4/tcp/4001")).is_err());
    }
}
