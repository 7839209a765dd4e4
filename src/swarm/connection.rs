//! An upgraded connection to a remote peer.

use multiaddr::Multiaddr;

use crate::error::Result;
use crate::identity::{PeerId, PublicKey};
use crate::mux::{MuxedStream, Muxer};
use crate::time;
use crate::transport::Direction;

/// A fully upgraded connection: authenticated, encrypted and muxed.
///
/// Owned by exactly one `NetworkPeer` inside the swarm; closing it resets
/// every stream and tears the underlying transport down.
pub struct Connection {
    id: u64,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_public_key: PublicKey,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
    direction: Direction,
    opened_at: u64,
    transient: bool,
    muxer: Muxer,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        local_peer: PeerId,
        remote_peer: PeerId,
        remote_public_key: PublicKey,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
        direction: Direction,
        muxer: Muxer,
    ) -> Connection {
        Connection {
            id,
            local_peer,
            remote_peer,
            remote_public_key,
            local_addr,
            remote_addr,
            direction,
            opened_at: time::now_timestamp_millis(),
            transient: false,
            muxer,
        }
    }

    /// Connection id, unique per upgrader
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Our side of the connection
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// The authenticated remote peer
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// The remote's identity key as proven in the handshake
    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public_key
    }

    /// Local transport address
    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    /// Remote transport address
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    /// Who initiated the connection
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Unix milliseconds at upgrade completion
    pub fn opened_at(&self) -> u64 {
        self.opened_at
    }

    /// Transient connections (e.g. over a relay) are not kept for reuse.
    /// No transient transport exists yet, so this is always `false`.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Open an outbound muxed stream
    pub async fn open_stream(&self) -> Result<MuxedStream> {
        self.muxer.open_stream(None).await
    }

    /// Receive the next inbound muxed stream; `None` once closed
    pub async fn accept_stream(&self) -> Option<MuxedStream> {
        self.muxer.accept_stream().await
    }

    /// Number of live streams
    pub fn num_streams(&self) -> usize {
        self.muxer.num_streams()
    }

    /// Has the connection been closed (locally or by the remote)?
    pub fn is_closed(&self) -> bool {
        self.muxer.is_closed()
    }

    /// Close the connection, resetting all streams
    pub fn close(&self) {
        self.muxer.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("streams", &self.num_streams())
            .finish()
    }
}
