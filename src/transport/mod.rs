//! # Transports & Connection Upgrading
//!
//! A transport knows how to turn a multiaddress into a raw bidirectional
//! byte stream (and back, via a listener). The [`Upgrader`] then layers the
//! rest of the stack on top:
//!
//! ```text
//! raw connection ──► Noise handshake ──► SecureChannel ──► Muxer ──► Connection
//! ```
//!
//! Only TCP is implemented; the trait seam keeps the swarm transport-
//! agnostic.

pub mod tcp;

pub use tcp::TcpTransport;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use multiaddr::Multiaddr;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::identity::{Keypair, PeerId};
use crate::mux::{Muxer, MuxerConfig};
use crate::noise::{self, NoiseConfig};
use crate::swarm::connection::Connection;

/// Who initiated a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We accepted it
    Inbound,
    /// We dialed it
    Outbound,
}

/// A way of dialing and listening on a class of multiaddresses
#[async_trait]
pub trait Transport: Send + Sync {
    /// Can this transport dial `addr`?
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Dial `addr` expecting to reach `peer`, returning a fully upgraded
    /// connection.
    async fn dial(&self, peer: PeerId, addr: Multiaddr) -> Result<Connection>;

    /// Bind a listener on `addr`
    async fn listen(&self, addr: Multiaddr) -> Result<Box<dyn Listener>>;
}

/// An open listening socket yielding upgraded connections
#[async_trait]
pub trait Listener: Send {
    /// The bound address (wildcard ports resolved)
    fn local_addr(&self) -> Multiaddr;

    /// Accept and upgrade the next inbound connection
    async fn accept(&mut self) -> Result<Connection>;
}

// ============================================================================
// UPGRADER
// ============================================================================

/// Assembles the transport → secure → muxer pipeline for both directions.
pub struct Upgrader {
    local_peer: PeerId,
    noise: NoiseConfig,
    muxer_config: MuxerConfig,
    next_conn_id: AtomicU64,
}

impl Upgrader {
    /// Build an upgrader for `identity`
    pub fn new(identity: &Keypair, muxer_config: MuxerConfig) -> Result<Upgrader> {
        Ok(Upgrader {
            local_peer: identity.peer_id(),
            noise: NoiseConfig::new(identity)?,
            muxer_config,
            next_conn_id: AtomicU64::new(0),
        })
    }

    /// Our peer id
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Upgrade a raw connection. Outbound upgrades must name the expected
    /// peer; the handshake aborts on a mismatch before any data flows.
    pub async fn upgrade<T>(
        &self,
        io: T,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
        direction: Direction,
        expected: Option<&PeerId>,
    ) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (channel, remote_peer, remote_key) = match direction {
            Direction::Outbound => noise::handshake_outbound(&self.noise, io, expected).await?,
            Direction::Inbound => noise::handshake_inbound(&self.noise, io).await?,
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let muxer = Muxer::new(channel, self.muxer_config.clone(), format!("conn-{id}"));
        tracing::debug!(
            id,
            peer = %remote_peer,
            addr = %remote_addr,
            ?direction,
            "connection upgraded"
        );
        Ok(Connection::new(
            id,
            self.local_peer,
            remote_peer,
            remote_key,
            local_addr,
            remote_addr,
            direction,
            muxer,
        ))
    }
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("local_peer", &self.local_peer)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
