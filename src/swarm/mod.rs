//! # Swarm
//!
//! The peer connectivity engine: transport registry, listener set, and the
//! per-peer dialer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              SWARM                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  dial_peer ──► DialWorker (per peer) ──► Transport.dial ──► Upgrader   │
//! │                   │  address ranking, retries, backoff                  │
//! │                   ▼                                                     │
//! │            register_connection ◄── Listener accept tasks (per bind)    │
//! │                   │  gater check, peer table, accept-stream loop        │
//! │                   ▼                                                     │
//! │            NetworkPeer { connections[] } ──► stream dispatcher (host)  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Wildcard listen binds (`0.0.0.0`, `::`) are expanded to concrete
//! interface addresses through a dirty-flagged cache, recomputed when the
//! listener set changes. Closing the swarm cancels every child task and
//! fails pending dials with `Closed`.

pub mod connection;
mod dialer;
pub mod gater;
pub mod rank;

pub use connection::Connection;
pub use gater::{AllowAll, ConnectionGater};
pub use rank::{rank_addresses, AddressDelay};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use multiaddr::Multiaddr;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::address;
use crate::bus::{EventBus, ListenAddressAdded, ListenAddressRemoved, PeerConnected, PeerDisconnected};
use crate::error::{Error, ErrorKind, Result};
use crate::identity::{Keypair, PeerId};
use crate::mux::{MuxedStream, MuxerConfig};
use crate::peerstore::{Peerstore, RECENTLY_CONNECTED_ADDR_TTL};
use crate::transport::{Direction, TcpTransport, Transport, Upgrader};

use dialer::DialRequest;

/// Swarm tuning knobs
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Per-attempt transport dial timeout
    pub dial_timeout: Duration,
    /// Attempts per address before it is given up
    pub max_retries: u32,
    /// Constant part of the retry backoff
    pub backoff_base: Duration,
    /// Quadratic part of the retry backoff (× retries²)
    pub backoff_coeff: Duration,
    /// How long an idle dial worker lingers before exiting
    pub worker_idle_timeout: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        SwarmConfig {
            dial_timeout: Duration::from_secs(15),
            max_retries: 3,
            backoff_base: Duration::from_secs(15),
            backoff_coeff: Duration::from_secs(1),
            worker_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Receives every inbound muxed stream the swarm accepts.
///
/// The host installs one of these to run protocol negotiation and its
/// handler table.
pub trait StreamDispatcher: Send + Sync {
    /// Take ownership of one inbound stream
    fn dispatch(&self, conn: Arc<Connection>, stream: MuxedStream);
}

impl<F> StreamDispatcher for F
where
    F: Fn(Arc<Connection>, MuxedStream) + Send + Sync,
{
    fn dispatch(&self, conn: Arc<Connection>, stream: MuxedStream) {
        self(conn, stream)
    }
}

struct DialerHandle {
    tx: mpsc::Sender<DialRequest>,
    generation: u64,
}

struct ListenerHandle {
    token: CancellationToken,
}

#[derive(Default)]
struct NetworkPeer {
    connections: SmallVec<[Arc<Connection>; 2]>,
}

#[derive(Default)]
struct IfaceCache {
    dirty: bool,
    addrs: Vec<Multiaddr>,
}

// ============================================================================
// SWARM INTERNALS
// ============================================================================

pub(crate) struct SwarmInner {
    pub(crate) local_peer: PeerId,
    pub(crate) transports: Vec<Arc<dyn Transport>>,
    peers: Mutex<HashMap<PeerId, NetworkPeer>>,
    dialers: Mutex<HashMap<PeerId, DialerHandle>>,
    next_generation: AtomicU64,
    listeners: Mutex<HashMap<Multiaddr, ListenerHandle>>,
    iface_cache: Mutex<IfaceCache>,
    pub(crate) peerstore: Arc<Peerstore>,
    pub(crate) gater: Arc<dyn ConnectionGater>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) config: SwarmConfig,
    pub(crate) shutdown: CancellationToken,
    closed: AtomicBool,
    dispatcher: RwLock<Option<Arc<dyn StreamDispatcher>>>,
}

impl SwarmInner {
    pub(crate) fn transport_for(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.can_dial(addr)).cloned()
    }

    /// First reusable open connection to `peer`
    pub(crate) fn connection_to(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.peers.lock().get(peer).and_then(|entry| {
            entry
                .connections
                .iter()
                .find(|c| !c.is_closed() && !c.is_transient())
                .cloned()
        })
    }

    /// Admit an upgraded connection: gater check, peer table insert,
    /// accept-stream loop, events.
    pub(crate) async fn register_connection(
        self: &Arc<Self>,
        conn: connection::Connection,
    ) -> Result<Arc<Connection>> {
        let peer = conn.remote_peer();
        let addr = conn.remote_addr().clone();
        let direction = conn.direction();

        if self.closed.load(Ordering::Acquire) {
            conn.close();
            return Err(Error::Closed);
        }
        if !self.gater.allow_connection(&peer, &addr, direction) {
            tracing::info!(peer = %peer, addr = %addr, "connection denied by gater");
            conn.close();
            return Err(Error::GaterDenied);
        }

        let conn = Arc::new(conn);
        self.peers
            .lock()
            .entry(peer)
            .or_default()
            .connections
            .push(conn.clone());

        // The address we actually reached the peer at stays warm for a
        // while.
        if direction == Direction::Outbound {
            let _ = self
                .peerstore
                .add_addresses(&peer, std::slice::from_ref(&addr), RECENTLY_CONNECTED_ADDR_TTL)
                .await;
        }

        let inner = self.clone();
        let accept_conn = conn.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        accept_conn.close();
                        break;
                    }
                    stream = accept_conn.accept_stream() => match stream {
                        None => break,
                        Some(stream) => {
                            let dispatcher = inner.dispatcher.read().clone();
                            match dispatcher {
                                Some(dispatcher) => dispatcher.dispatch(accept_conn.clone(), stream),
                                None => {
                                    tracing::debug!(peer = %peer, "inbound stream dropped: no dispatcher");
                                }
                            }
                        }
                    }
                }
            }
            let cause = if inner.closed.load(Ordering::Acquire) {
                ErrorKind::Closed
            } else {
                ErrorKind::Io
            };
            inner.remove_connection(&peer, accept_conn.id(), cause);
        });

        tracing::info!(peer = %peer, addr = %addr, ?direction, "connected");
        self.bus.publish(PeerConnected {
            peer,
            addr,
            direction,
        });
        Ok(conn)
    }

    fn remove_connection(&self, peer: &PeerId, conn_id: u64, cause: ErrorKind) {
        {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(peer) {
                entry.connections.retain(|c| c.id() != conn_id);
                if entry.connections.is_empty() {
                    peers.remove(peer);
                }
            }
        }
        tracing::info!(peer = %peer, ?cause, "disconnected");
        self.bus.publish(PeerDisconnected { peer: *peer, cause });
    }

    fn dialer_for(self: &Arc<Self>, peer: &PeerId) -> mpsc::Sender<DialRequest> {
        let mut dialers = self.dialers.lock();
        if let Some(handle) = dialers.get(peer) {
            if !handle.tx.is_closed() {
                return handle.tx.clone();
            }
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tx = dialer::spawn_worker(self.clone(), *peer, generation);
        dialers.insert(
            *peer,
            DialerHandle {
                tx: tx.clone(),
                generation,
            },
        );
        tx
    }

    pub(crate) fn remove_dialer(&self, peer: &PeerId, generation: u64) {
        let mut dialers = self.dialers.lock();
        if let Some(handle) = dialers.get(peer) {
            if handle.generation == generation {
                dialers.remove(peer);
            }
        }
    }

    pub(crate) async fn dial_peer(self: &Arc<Self>, peer: PeerId) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if peer == self.local_peer {
            return Err(Error::InvalidAddress("cannot dial self".into()));
        }
        if let Some(conn) = self.connection_to(&peer) {
            return Ok(conn);
        }

        // A worker can exit between lookup and send; retry once against a
        // fresh one.
        for _ in 0..2 {
            let tx = self.dialer_for(&peer);
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(DialRequest { reply: reply_tx }).await.is_err() {
                continue;
            }
            match reply_rx.await {
                Ok(outcome) => return outcome,
                Err(_) => continue,
            }
        }
        Err(Error::Closed)
    }

    pub(crate) async fn listen_on(self: &Arc<Self>, addr: Multiaddr) -> Result<Multiaddr> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let transport = self
            .transport_for(&addr)
            .ok_or_else(|| Error::InvalidAddress(format!("no transport can listen on {addr}")))?;
        let mut listener = transport.listen(addr).await?;
        let bound = listener.local_addr();

        let token = self.shutdown.child_token();
        self.listeners.lock().insert(
            bound.clone(),
            ListenerHandle {
                token: token.clone(),
            },
        );
        self.iface_cache.lock().dirty = true;

        let inner = self.clone();
        let task_addr = bound.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => {
                            if let Err(e) = inner.register_connection(conn).await {
                                tracing::debug!(error = %e, "inbound connection rejected");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(addr = %task_addr, error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            inner.listeners.lock().remove(&task_addr);
            inner.iface_cache.lock().dirty = true;
            inner.bus.publish(ListenAddressRemoved(task_addr.clone()));
            tracing::info!(addr = %task_addr, "listener closed");
        });

        self.bus.publish(ListenAddressAdded(bound.clone()));
        Ok(bound)
    }

    pub(crate) fn remove_listener(&self, addr: &Multiaddr) -> bool {
        match self.listeners.lock().get(addr) {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn listen_addresses(&self) -> Vec<Multiaddr> {
        let bound: Vec<Multiaddr> = self.listeners.lock().keys().cloned().collect();
        let mut cache = self.iface_cache.lock();
        if cache.dirty {
            cache.addrs = expand_listen_addresses(&bound);
            cache.dirty = false;
        }
        cache.addrs.clone()
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("swarm closing");
        self.shutdown.cancel();
        let connections: Vec<Arc<Connection>> = self
            .peers
            .lock()
            .values()
            .flat_map(|entry| entry.connections.iter().cloned())
            .collect();
        for conn in connections {
            conn.close();
        }
    }
}

/// Expand wildcard binds to per-interface addresses, filtering link-local
/// IPv6.
fn expand_listen_addresses(bound: &[Multiaddr]) -> Vec<Multiaddr> {
    let mut out: Vec<Multiaddr> = Vec::new();
    let mut iface_ips: Option<Vec<IpAddr>> = None;
    for addr in bound {
        match address::host_port(addr) {
            Some((ip, port)) if ip.is_unspecified() => {
                let ips = iface_ips.get_or_insert_with(interface_ips);
                for iface_ip in ips.iter() {
                    if iface_ip.is_ipv4() == ip.is_ipv4() {
                        out.push(address::from_socket_addr(SocketAddr::new(*iface_ip, port)));
                    }
                }
            }
            _ => out.push(addr.clone()),
        }
    }
    out.sort_by(|a, b| a.to_vec().cmp(&b.to_vec()));
    out.dedup();
    out
}

fn interface_ips() -> Vec<IpAddr> {
    match NetworkInterface::show() {
        Ok(interfaces) => interfaces
            .into_iter()
            .flat_map(|iface| iface.addr.into_iter())
            .filter_map(|addr| match addr {
                network_interface::Addr::V4(v4) => Some(IpAddr::V4(v4.ip)),
                network_interface::Addr::V6(v6) => {
                    if address::is_v6_link_local(v6.ip) {
                        None
                    } else {
                        Some(IpAddr::V6(v6.ip))
                    }
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "interface enumeration failed");
            Vec::new()
        }
    }
}

// ============================================================================
// SWARM HANDLE
// ============================================================================

/// The public handle around the connectivity engine
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    /// Build a swarm for `identity` with a TCP transport
    pub fn new(
        identity: &Keypair,
        peerstore: Arc<Peerstore>,
        bus: Arc<EventBus>,
        gater: Arc<dyn ConnectionGater>,
        config: SwarmConfig,
        muxer_config: MuxerConfig,
    ) -> Result<Swarm> {
        let upgrader = Arc::new(Upgrader::new(identity, muxer_config)?);
        let transports: Vec<Arc<dyn Transport>> = vec![Arc::new(TcpTransport::new(upgrader))];
        Ok(Swarm {
            inner: Arc::new(SwarmInner {
                local_peer: identity.peer_id(),
                transports,
                peers: Mutex::new(HashMap::new()),
                dialers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                listeners: Mutex::new(HashMap::new()),
                iface_cache: Mutex::new(IfaceCache::default()),
                peerstore,
                gater,
                bus,
                config,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                dispatcher: RwLock::new(None),
            }),
        })
    }

    /// Our peer id
    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    /// The peerstore backing this swarm
    pub fn peerstore(&self) -> &Arc<Peerstore> {
        &self.inner.peerstore
    }

    /// The event bus connections and listeners publish on
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Install the inbound stream dispatcher (the host does this)
    pub fn set_stream_dispatcher(&self, dispatcher: Arc<dyn StreamDispatcher>) {
        *self.inner.dispatcher.write() = Some(dispatcher);
    }

    /// Connect to `peer`, reusing an open connection when there is one.
    /// Concurrent calls for the same peer coalesce onto one dial attempt.
    pub async fn dial_peer(&self, peer: PeerId) -> Result<Arc<Connection>> {
        self.inner.dial_peer(peer).await
    }

    /// Start listening on `addr`; returns the bound address
    pub async fn listen_on(&self, addr: Multiaddr) -> Result<Multiaddr> {
        self.inner.listen_on(addr).await
    }

    /// Stop the listener bound to `addr`
    pub fn remove_listener(&self, addr: &Multiaddr) -> bool {
        self.inner.remove_listener(addr)
    }

    /// Listen addresses with wildcard binds expanded to interfaces
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.inner.listen_addresses()
    }

    /// All open connections to `peer`
    pub fn connections_to(&self, peer: &PeerId) -> Vec<Arc<Connection>> {
        self.inner
            .peers
            .lock()
            .get(peer)
            .map(|entry| entry.connections.to_vec())
            .unwrap_or_default()
    }

    /// Is there at least one open connection to `peer`?
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.connection_to(peer).is_some()
    }

    /// Shut the swarm down: cancel listeners, dial workers and
    /// connections. Pending dials fail with `Closed`.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Has [`Swarm::close`] run?
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("local_peer", &self.inner.local_peer)
            .field("peers", &self.inner.peers.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Swarm {
    fn drop(&mut self) {
        self.inner.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peerstore::PERMANENT_ADDR_TTL;

    fn swarm_with(config: SwarmConfig) -> (Swarm, Keypair) {
        let identity = Keypair::generate();
        let swarm = Swarm::new(
            &identity,
            Arc::new(Peerstore::memory()),
            Arc::new(EventBus::new()),
            Arc::new(AllowAll),
            config,
            MuxerConfig::default(),
        )
        .unwrap();
        (swarm, identity)
    }

    fn swarm() -> (Swarm, Keypair) {
        swarm_with(SwarmConfig::default())
    }

    async fn connect(a: &Swarm, b: &Swarm) -> Arc<Connection> {
        let addr = b
            .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        a.peerstore()
            .add_addresses(&b.local_peer(), &[addr], PERMANENT_ADDR_TTL)
            .await
            .unwrap();
        a.dial_peer(b.local_peer()).await.unwrap()
    }

    #[tokio::test]
    async fn test_dial_and_reuse() {
        let (alice, _) = swarm();
        let (bob, _) = swarm();

        let conn = connect(&alice, &bob).await;
        assert_eq!(conn.remote_peer(), bob.local_peer());
        assert!(alice.is_connected(&bob.local_peer()));

        // Second dial reuses the open connection.
        let again = alice.dial_peer(bob.local_peer()).await.unwrap();
        assert_eq!(again.id(), conn.id());
        assert_eq!(alice.connections_to(&bob.local_peer()).len(), 1);

        // The listening side registered the inbound connection too.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bob.is_connected(&alice.local_peer()));
    }

    #[tokio::test]
    async fn test_concurrent_dials_coalesce() {
        let (alice, _) = swarm();
        let (bob, _) = swarm();

        let addr = bob
            .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        alice
            .peerstore()
            .add_addresses(&bob.local_peer(), &[addr], PERMANENT_ADDR_TTL)
            .await
            .unwrap();

        let alice = Arc::new(alice);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let alice = alice.clone();
            let bob_id = bob.local_peer();
            tasks.push(tokio::spawn(async move {
                alice.dial_peer(bob_id).await.map(|c| c.id())
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "all callers share one connection");
        assert_eq!(alice.connections_to(&bob.local_peer()).len(), 1);
    }

    #[tokio::test]
    async fn test_dial_unknown_peer() {
        let (alice, _) = swarm();
        let stranger = Keypair::generate().peer_id();
        assert!(matches!(
            alice.dial_peer(stranger).await,
            Err(Error::NoAddresses(p)) if p == stranger
        ));
    }

    #[tokio::test]
    async fn test_dial_retries_then_aggregates_errors() {
        let (alice, _) = swarm_with(SwarmConfig {
            dial_timeout: Duration::from_secs(2),
            max_retries: 2,
            backoff_base: Duration::from_millis(50),
            backoff_coeff: Duration::from_millis(10),
            ..SwarmConfig::default()
        });
        let target = Keypair::generate().peer_id();
        // Nobody listens on port 1.
        alice
            .peerstore()
            .add_addresses(
                &target,
                &["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
                PERMANENT_ADDR_TTL,
            )
            .await
            .unwrap();

        let started = std::time::Instant::now();
        match alice.dial_peer(target).await {
            Err(Error::Dial(dial)) => {
                assert_eq!(dial.attempts.len(), 1);
                assert_eq!(dial.attempts[0].0, "/ip4/127.0.0.1/tcp/1".parse().unwrap());
            }
            other => panic!("expected DialError, got {other:?}"),
        }
        // One retry with at least the base backoff must have elapsed.
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_gater_denies_dial() {
        struct DenyDials;
        impl ConnectionGater for DenyDials {
            fn allow_dial(&self, _: &PeerId, _: &Multiaddr) -> bool {
                false
            }
        }

        let identity = Keypair::generate();
        let alice = Swarm::new(
            &identity,
            Arc::new(Peerstore::memory()),
            Arc::new(EventBus::new()),
            Arc::new(DenyDials),
            SwarmConfig::default(),
            MuxerConfig::default(),
        )
        .unwrap();
        let (bob, _) = swarm();
        let addr = bob
            .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        alice
            .peerstore()
            .add_addresses(&bob.local_peer(), &[addr], PERMANENT_ADDR_TTL)
            .await
            .unwrap();

        match alice.dial_peer(bob.local_peer()).await {
            Err(Error::Dial(dial)) => {
                assert!(dial.attempts[0].1.contains("denied by gater"));
            }
            other => panic!("expected DialError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_events() {
        let (alice, _) = swarm();
        let (bob, _) = swarm();
        let mut connected = alice.bus().subscribe::<PeerConnected>();
        let mut disconnected = alice.bus().subscribe::<PeerDisconnected>();

        let conn = connect(&alice, &bob).await;
        let event = connected.recv().await.unwrap();
        assert_eq!(event.peer, bob.local_peer());
        assert_eq!(event.direction, Direction::Outbound);

        conn.close();
        let event = disconnected.recv().await.unwrap();
        assert_eq!(event.peer, bob.local_peer());
    }

    #[tokio::test]
    async fn test_wildcard_listen_expansion() {
        let (swarm, _) = swarm();
        let bound = swarm
            .listen_on("/ip4/0.0.0.0/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let port = address::host_port(&bound).unwrap().1;
        assert_ne!(port, 0);

        let expanded = swarm.listen_addresses();
        assert!(!expanded.is_empty());
        for addr in &expanded {
            let (ip, addr_port) = address::host_port(addr).unwrap();
            assert!(!ip.is_unspecified(), "wildcard must be expanded: {addr}");
            assert_eq!(addr_port, port);
        }
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let (swarm, _) = swarm();
        let bound = swarm
            .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(swarm.listen_addresses(), vec![bound.clone()]);

        assert!(swarm.remove_listener(&bound));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(swarm.listen_addresses().is_empty());
        assert!(!swarm.remove_listener(&bound));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_new_dials() {
        let (alice, _) = swarm();
        let (bob, _) = swarm();
        let conn = connect(&alice, &bob).await;

        alice.close();
        assert!(alice.is_closed());
        assert!(conn.is_closed());
        assert!(matches!(
            alice.dial_peer(bob.local_peer()).await,
            Err(Error::Closed)
        ));
    }
}
