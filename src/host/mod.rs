//! # Host
//!
//! The application-facing surface of the stack: a stream handler table,
//! protocol negotiation on every stream, and the built-in ping service.
//!
//! ## Stream Paths
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              HOST                                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  outbound: new_stream(peer, protocols)                                  │
//! │      └─► swarm.dial_peer ─► open muxed stream ─► multistream dialer     │
//! │          (known-supported protocol proposed first) ─► caller            │
//! │                                                                         │
//! │  inbound:  swarm stream dispatcher                                      │
//! │      └─► multistream listener over the handler table ─► handler task    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers are registered per protocol id, optionally with a predicate so
//! one handler can serve a family of ids (e.g. versioned protocols).

pub mod ping;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use multiaddr::Multiaddr;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::address::AddressInfo;
use crate::bus::{EventBus, LocalProtocolsUpdated};
use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerId};
use crate::multistream::{self, ProtocolLookup};
use crate::mux::{MuxedStream, MuxerConfig};
use crate::peerstore::{Peerstore, PeerstoreConfig, TEMP_ADDR_TTL};
use crate::swarm::{AllowAll, Connection, ConnectionGater, Swarm, SwarmConfig};
use crate::time::SystemClock;

/// Handler invoked with each negotiated inbound stream
pub type StreamHandler = Arc<dyn Fn(PeerId, MuxedStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Predicate extending a handler to a family of protocol ids
pub type ProtocolMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct HandlerEntry {
    protocol: String,
    matcher: Option<ProtocolMatcher>,
    handler: StreamHandler,
}

/// Host construction knobs
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    /// Addresses to listen on at [`Host::start`]
    pub listen_addrs: Vec<Multiaddr>,
    /// Swarm configuration
    pub swarm: SwarmConfig,
    /// Muxer configuration
    pub muxer: MuxerConfig,
    /// Peerstore configuration (used by [`Host::new`]'s built-in
    /// in-memory peerstore)
    pub peerstore: PeerstoreConfig,
}

struct HostInner {
    swarm: Swarm,
    bus: Arc<EventBus>,
    handlers: RwLock<Vec<HandlerEntry>>,
    pending_listen: parking_lot::Mutex<Vec<Multiaddr>>,
    shutdown: CancellationToken,
}

/// A peer: identity, connectivity and protocol dispatch in one handle
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Host with an in-memory peerstore and the default gater
    pub fn new(identity: &Keypair, config: HostConfig) -> Result<Host> {
        let peerstore = Arc::new(Peerstore::new(
            Arc::new(crate::peerstore::MemoryStore::new()),
            Arc::new(SystemClock),
            config.peerstore.clone(),
        ));
        Host::with_parts(identity, peerstore, Arc::new(AllowAll), config)
    }

    /// Host over caller-provided peerstore and gater
    pub fn with_parts(
        identity: &Keypair,
        peerstore: Arc<Peerstore>,
        gater: Arc<dyn ConnectionGater>,
        config: HostConfig,
    ) -> Result<Host> {
        let bus = Arc::new(EventBus::new());
        let swarm = Swarm::new(
            identity,
            peerstore,
            bus.clone(),
            gater,
            config.swarm.clone(),
            config.muxer.clone(),
        )?;

        let inner = Arc::new(HostInner {
            swarm,
            bus,
            handlers: RwLock::new(Vec::new()),
            pending_listen: parking_lot::Mutex::new(config.listen_addrs),
            shutdown: CancellationToken::new(),
        });

        let dispatch_inner = inner.clone();
        inner
            .swarm
            .set_stream_dispatcher(Arc::new(move |conn: Arc<Connection>, stream: MuxedStream| {
                let inner = dispatch_inner.clone();
                tokio::spawn(serve_inbound_stream(inner, conn, stream));
            }));

        let host = Host { inner };
        ping::register(&host);
        Ok(host)
    }

    /// Bring the host up: bind the configured listen addresses and start
    /// the peerstore GC.
    pub async fn start(&self) -> Result<()> {
        let addrs: Vec<Multiaddr> = std::mem::take(&mut *self.inner.pending_listen.lock());
        for addr in addrs {
            self.inner.swarm.listen_on(addr).await?;
        }
        self.peerstore().spawn_gc(self.inner.shutdown.child_token());
        tracing::info!(peer = %self.local_peer(), "host started");
        Ok(())
    }

    /// Start listening on one more address; returns the bound address
    pub async fn listen_on(&self, addr: Multiaddr) -> Result<Multiaddr> {
        self.inner.swarm.listen_on(addr).await
    }

    /// Our peer id
    pub fn local_peer(&self) -> PeerId {
        self.inner.swarm.local_peer()
    }

    /// The peerstore
    pub fn peerstore(&self) -> &Arc<Peerstore> {
        self.inner.swarm.peerstore()
    }

    /// The event bus
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// The underlying swarm
    pub fn swarm(&self) -> &Swarm {
        &self.inner.swarm
    }

    /// Listen addresses (wildcards expanded)
    pub fn addresses(&self) -> Vec<Multiaddr> {
        self.inner.swarm.listen_addresses()
    }

    // ------------------------------------------------------------------
    // Handler table
    // ------------------------------------------------------------------

    /// Register `handler` for exactly `protocol`
    pub fn set_stream_handler<F, Fut>(&self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(PeerId, MuxedStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.insert_handler(protocol.into(), None, handler);
    }

    /// Register `handler` for `protocol` plus anything `matcher` accepts
    pub fn set_stream_handler_match<F, Fut>(
        &self,
        protocol: impl Into<String>,
        matcher: ProtocolMatcher,
        handler: F,
    ) where
        F: Fn(PeerId, MuxedStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.insert_handler(protocol.into(), Some(matcher), handler);
    }

    fn insert_handler<F, Fut>(&self, protocol: String, matcher: Option<ProtocolMatcher>, handler: F)
    where
        F: Fn(PeerId, MuxedStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: StreamHandler =
            Arc::new(move |peer, stream| handler(peer, stream).boxed());
        {
            let mut handlers = self.inner.handlers.write();
            handlers.retain(|entry| entry.protocol != protocol);
            handlers.push(HandlerEntry {
                protocol: protocol.clone(),
                matcher,
                handler,
            });
        }
        tracing::debug!(protocol = %protocol, "stream handler registered");
        self.inner.bus.publish(LocalProtocolsUpdated {
            added: vec![protocol],
            removed: vec![],
        });
    }

    /// Deregister the handler for `protocol`
    pub fn remove_stream_handler(&self, protocol: &str) {
        let removed = {
            let mut handlers = self.inner.handlers.write();
            let before = handlers.len();
            handlers.retain(|entry| entry.protocol != protocol);
            handlers.len() != before
        };
        if removed {
            self.inner.bus.publish(LocalProtocolsUpdated {
                added: vec![],
                removed: vec![protocol.to_string()],
            });
        }
    }

    /// Exactly-registered protocol ids
    pub fn protocols(&self) -> Vec<String> {
        self.inner
            .handlers
            .read()
            .iter()
            .map(|entry| entry.protocol.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    /// Remember `info`'s addresses briefly and make sure a connection
    /// exists.
    pub async fn connect(&self, info: &AddressInfo) -> Result<()> {
        if !info.addrs.is_empty() {
            self.peerstore()
                .add_addresses(&info.peer_id, &info.addrs, TEMP_ADDR_TTL)
                .await?;
        }
        if !self.inner.swarm.is_connected(&info.peer_id) {
            self.inner.swarm.dial_peer(info.peer_id).await?;
        }
        Ok(())
    }

    /// Open a stream to `peer` speaking one of `protocols` (in preference
    /// order). A protocol the peerstore already knows the peer supports is
    /// proposed first.
    pub async fn new_stream(&self, peer: PeerId, protocols: &[String]) -> Result<MuxedStream> {
        if protocols.is_empty() {
            return Err(Error::NegotiationFailed);
        }
        let conn = self.inner.swarm.dial_peer(peer).await?;
        let mut stream = conn.open_stream().await?;

        let mut ordered = protocols.to_vec();
        if let Ok(Some(preferred)) = self.peerstore().first_supported(&peer, protocols).await {
            if let Some(pos) = ordered.iter().position(|p| *p == preferred) {
                let preferred = ordered.remove(pos);
                ordered.insert(0, preferred);
            }
        }

        match multistream::dialer_select(&mut stream, &ordered).await {
            Ok(protocol) => {
                stream.set_protocol(protocol.clone());
                let _ = self
                    .peerstore()
                    .proto_book()
                    .add_protocols(&peer, std::slice::from_ref(&protocol))
                    .await;
                Ok(stream)
            }
            Err(e) => {
                let _ = stream.reset().await;
                Err(e)
            }
        }
    }

    /// Measure one ping round trip to `peer`
    pub async fn ping(&self, peer: PeerId) -> Result<Duration> {
        let mut client = self.ping_client(peer).await?;
        let rtt = client.round().await?;
        client.close().await;
        Ok(rtt)
    }

    /// Open a reusable ping session to `peer`
    pub async fn ping_client(&self, peer: PeerId) -> Result<ping::PingClient> {
        let stream = self
            .new_stream(peer, &[ping::PROTOCOL_ID.to_string()])
            .await?;
        Ok(ping::PingClient::new(
            peer,
            stream,
            self.peerstore().clone(),
        ))
    }

    /// Shut the host and its swarm down
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.swarm.close();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peer", &self.local_peer())
            .field("protocols", &self.protocols())
            .finish()
    }
}

/// Snapshot of the handler table for one negotiation
struct TableSnapshot {
    entries: Vec<(String, Option<ProtocolMatcher>)>,
}

impl ProtocolLookup for TableSnapshot {
    fn matches(&self, proto: &str) -> bool {
        self.entries.iter().any(|(id, matcher)| {
            id == proto || matcher.as_ref().is_some_and(|m| m(proto))
        })
    }

    fn protocols(&self) -> Vec<String> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }
}

/// Negotiate and dispatch one inbound stream
async fn serve_inbound_stream(inner: Arc<HostInner>, conn: Arc<Connection>, mut stream: MuxedStream) {
    let snapshot = TableSnapshot {
        entries: inner
            .handlers
            .read()
            .iter()
            .map(|entry| (entry.protocol.clone(), entry.matcher.clone()))
            .collect(),
    };

    let protocol = match multistream::listener_negotiate(&mut stream, &snapshot).await {
        Ok(protocol) => protocol,
        Err(e) => {
            tracing::debug!(peer = %conn.remote_peer(), error = %e, "inbound negotiation failed");
            let _ = stream.reset().await;
            return;
        }
    };
    stream.set_protocol(protocol.clone());

    let handler = inner.handlers.read().iter().find_map(|entry| {
        let hit = entry.protocol == protocol
            || entry.matcher.as_ref().is_some_and(|m| m(&protocol));
        hit.then(|| entry.handler.clone())
    });
    match handler {
        Some(handler) => handler(conn.remote_peer(), stream).await,
        None => {
            // Handler table changed between negotiation and dispatch.
            let _ = stream.reset().await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
