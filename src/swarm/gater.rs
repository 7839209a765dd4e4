//! Connection admission policy.

use multiaddr::Multiaddr;

use crate::identity::PeerId;
use crate::transport::Direction;

/// Policy hook consulted before dialing and before admitting a connection.
///
/// Rejections surface as `GaterDenied` and are never retried.
pub trait ConnectionGater: Send + Sync {
    /// May we dial `peer` at `addr`?
    fn allow_dial(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        true
    }

    /// May this upgraded connection be admitted?
    fn allow_connection(&self, _peer: &PeerId, _addr: &Multiaddr, _direction: Direction) -> bool {
        true
    }
}

/// The default gater: admits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ConnectionGater for AllowAll {}
