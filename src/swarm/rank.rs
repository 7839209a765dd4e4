//! Dial-order ranking of candidate addresses.
//!
//! Candidates are bucketed by reachability (loopback, private, public,
//! relay) and staggered inside each bucket happy-eyeballs style: IPv6
//! before IPv4, QUIC-like (udp) before TCP. The resulting delays feed the
//! dialer's schedule, so the likeliest-cheapest address is tried first and
//! slower candidates start a beat later instead of all at once.
//!
//! Scoring table:
//!
//! ```text
//! bucket base       loopback 0ms · private 30ms · public 250ms · relay +500ms
//! in-bucket offset  udp/v6 +0 · udp/v4 +50ms · tcp/v6 +100ms · tcp/v4 +150ms
//!                   (loopback addresses skip the in-bucket offsets)
//! ```
//!
//! No QUIC transport exists yet; udp candidates rank but never dial.

use std::net::IpAddr;
use std::time::Duration;

use multiaddr::Multiaddr;

use crate::address::{self, AddressClass, TransportTag};

/// Base delay for private addresses
const PRIVATE_DELAY: Duration = Duration::from_millis(30);
/// Base delay for public addresses
const PUBLIC_DELAY: Duration = Duration::from_millis(250);
/// Extra delay for relayed addresses
const RELAY_DELAY: Duration = Duration::from_millis(500);
/// Happy-eyeballs stagger of IPv4 behind IPv6
const V4_DELAY: Duration = Duration::from_millis(50);
/// Stagger of TCP behind QUIC-like transports
const TCP_DELAY: Duration = Duration::from_millis(100);

/// A dial candidate and when to launch it, relative to the dial start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDelay {
    /// The candidate address
    pub address: Multiaddr,
    /// Schedule offset
    pub delay: Duration,
}

/// Rank `addrs` into schedule offsets, cheapest first
pub fn rank_addresses(addrs: &[Multiaddr]) -> Vec<AddressDelay> {
    let mut ranked: Vec<AddressDelay> = addrs
        .iter()
        .map(|addr| AddressDelay {
            address: addr.clone(),
            delay: score(addr),
        })
        .collect();
    ranked.sort_by_key(|candidate| candidate.delay);
    ranked
}

fn score(addr: &Multiaddr) -> Duration {
    let class = address::address_class(addr);
    let mut delay = match class {
        AddressClass::Loopback => Duration::ZERO,
        AddressClass::Private => PRIVATE_DELAY,
        AddressClass::Public => PUBLIC_DELAY,
    };
    if address::is_relay(addr) {
        delay += RELAY_DELAY;
    }
    if class == AddressClass::Loopback {
        return delay;
    }

    if address::transport_tag(addr) != TransportTag::Udp {
        delay += TCP_DELAY;
    }
    if matches!(address::host_port(addr), Some((IpAddr::V4(_), _))) {
        delay += V4_DELAY;
    }
    delay
}

// ============================================================================
// TESTS
// ============================================================================
