//! TCP transport.

use std::sync::Arc;

use async_trait::async_trait;
use multiaddr::Multiaddr;
use tokio::net::{TcpListener, TcpStream};

use crate::address::{self, TransportTag};
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::swarm::connection::Connection;
use crate::transport::{Direction, Listener, Transport, Upgrader};

/// Dials and listens over plain TCP, upgrading every connection through
/// the shared [`Upgrader`].
pub struct TcpTransport {
    upgrader: Arc<Upgrader>,
}

impl TcpTransport {
    /// TCP transport sharing `upgrader`
    pub fn new(upgrader: Arc<Upgrader>) -> TcpTransport {
        TcpTransport { upgrader }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        address::transport_tag(addr) == TransportTag::Tcp
            && address::to_socket_addr(addr).is_some()
    }

    async fn dial(&self, peer: PeerId, addr: Multiaddr) -> Result<Connection> {
        let socket_addr = address::to_socket_addr(&addr)
            .ok_or_else(|| Error::InvalidAddress(format!("{addr} is not dialable over tcp")))?;
        tracing::debug!(peer = %peer, addr = %addr, "tcp dial");

        let stream = TcpStream::connect(socket_addr).await?;
        stream.set_nodelay(true)?;
        let local_addr = address::from_socket_addr(stream.local_addr()?);

        self.upgrader
            .upgrade(stream, local_addr, addr, Direction::Outbound, Some(&peer))
            .await
    }

    async fn listen(&self, addr: Multiaddr) -> Result<Box<dyn Listener>> {
        let socket_addr = address::to_socket_addr(&addr)
            .ok_or_else(|| Error::InvalidAddress(format!("{addr} is not a tcp listen address")))?;
        let listener = TcpListener::bind(socket_addr).await?;
        let local_addr = address::from_socket_addr(listener.local_addr()?);
        tracing::info!(addr = %local_addr, "tcp listening");

        Ok(Box::new(TcpTransportListener {
            listener,
            local_addr,
            upgrader: self.upgrader.clone(),
        }))
    }
}

/// A bound TCP listener
pub struct TcpTransportListener {
    listener: TcpListener,
    local_addr: Multiaddr,
    upgrader: Arc<Upgrader>,
}

#[async_trait]
impl Listener for TcpTransportListener {
    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    async fn accept(&mut self) -> Result<Connection> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let remote_addr = address::from_socket_addr(remote);
        tracing::debug!(addr = %remote_addr, "tcp accepted");

        self.upgrader
            .upgrade(
                stream,
                self.local_addr.clone(),
                remote_addr,
                Direction::Inbound,
                None,
            )
            .await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::mux::MuxerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn transport(identity: &Keypair) -> TcpTransport {
        TcpTransport::new(Arc::new(
            Upgrader::new(identity, MuxerConfig::default()).unwrap(),
        ))
    }

    #[test]
    fn test_can_dial() {
        let t = transport(&Keypair::generate());
        assert!(t.can_dial(&"/ip4/127.0.0.1/tcp/4001".parse().unwrap()));
        assert!(t.can_dial(&"/ip6/::1/tcp/4001".parse().unwrap()));
        assert!(!t.can_dial(&"/ip4/127.0.0.1/udp/4001".parse().unwrap()));
        assert!(!t.can_dial(&"/ip4/127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_dial_listen_roundtrip() {
        let server_key = Keypair::generate();
        let client_key = Keypair::generate();
        let server = transport(&server_key);
        let client = transport(&client_key);

        let mut listener = server
            .listen("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let listen_addr = listener.local_addr();
        assert!(address::to_socket_addr(&listen_addr).unwrap().port() != 0);

        let server_task = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let mut stream = conn.accept_stream().await.unwrap();
            let mut text = String::new();
            stream.read_to_string(&mut text).await.unwrap();
            stream.write_all(text.to_uppercase().as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            conn.remote_peer()
        });

        let conn = client
            .dial(server_key.peer_id(), listen_addr)
            .await
            .unwrap();
        assert_eq!(conn.remote_peer(), server_key.peer_id());

        let mut stream = conn.open_stream().await.unwrap();
        stream.write_all(b"hello tcp").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "HELLO TCP");

        assert_eq!(server_task.await.unwrap(), client_key.peer_id());
    }

    #[tokio::test]
    async fn test_dial_wrong_peer_fails() {
        let server_key = Keypair::generate();
        let server = transport(&server_key);
        let client = transport(&Keypair::generate());

        let mut listener = server
            .listen("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let listen_addr = listener.local_addr();
        let server_task = tokio::spawn(async move { listener.accept().await });

        let stranger = Keypair::generate().peer_id();
        let result = client.dial(stranger, listen_addr).await;
        assert!(matches!(result, Err(Error::PeerIdMismatch { .. })));
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let client = transport(&Keypair::generate());
        // Port 1 on loopback is almost certainly closed.
        let result = client
            .dial(
                Keypair::generate().peer_id(),
                "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
            )
            .await;
        assert!(result.is_err());
    }
}
