//! # Peerstore
//!
//! Everything we remember about peers, split into sub-stores that share
//! one [`KVStore`] under namespaced key prefixes:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            PEERSTORE                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  /peers/addresses/<b32>        address book: TTL leases + certified     │
//! │                                records, LRU cache, background GC        │
//! │  /peers/keys/<b32>/public      key book: public keys, encrypted         │
//! │  /peers/keys/<b32>/private     local private keys (PBKDF2 + AES-GCM)    │
//! │  /peers/protocols/<b32>        protocol book: bounded protocol sets     │
//! │  /peers/metadata/<b32>/<key>   metadata book: typed annotations         │
//! │                                                                         │
//! │  metrics (in-memory): per-peer latency EWMA                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `<b32>` is the lowercase unpadded base32 of the peer id bytes.
//! Operations on the same peer serialize on per-peer locks; distinct peers
//! proceed concurrently.

pub mod addr_book;
pub mod key_book;
pub mod metadata;
pub mod metrics;
pub mod proto_book;
pub mod sqlite;
pub mod store;

pub use addr_book::{AddressBook, GcStats};
pub use key_book::{KdfHash, KeyBook, KeychainConfig};
pub use metadata::MetadataBook;
pub use metrics::Metrics;
pub use proto_book::ProtocolBook;
pub use sqlite::SqliteStore;
pub use store::{KVBatch, KVStore, MemoryStore};

use std::sync::Arc;
use std::time::Duration;

use multiaddr::Multiaddr;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::identity::PeerId;
use crate::time::{Clock, SystemClock};

// ============================================================================
// TTL CONSTANTS
// ============================================================================

/// Addresses learned opportunistically (e.g. from a dial target)
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);
/// Addresses of peers we recently had a connection to
pub const RECENTLY_CONNECTED_ADDR_TTL: Duration = Duration::from_secs(30 * 60);
/// Addresses learned from content/provider advertisements
pub const PROVIDER_ADDR_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Addresses pinned forever (bootstrap peers, explicit configuration)
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

// ============================================================================
// KEY SCHEME
// ============================================================================

pub(crate) const ADDRESSES_PREFIX: &str = "/peers/addresses/";
pub(crate) const KEYS_PREFIX: &str = "/peers/keys/";
pub(crate) const PROTOCOLS_PREFIX: &str = "/peers/protocols/";
pub(crate) const METADATA_PREFIX: &str = "/peers/metadata/";

/// `<prefix><base32lower-nopad(peer bytes)>`
pub(crate) fn peer_key(prefix: &str, peer: &PeerId) -> String {
    format!(
        "{prefix}{}",
        data_encoding::BASE32_NOPAD
            .encode(&peer.to_bytes())
            .to_lowercase()
    )
}

/// Inverse of [`peer_key`]; tolerant of trailing sub-paths
pub(crate) fn peer_from_key(prefix: &str, key: &str) -> Option<PeerId> {
    let rest = key.strip_prefix(prefix)?;
    let encoded = rest.split('/').next()?;
    let bytes = data_encoding::BASE32_NOPAD
        .decode(encoded.to_uppercase().as_bytes())
        .ok()?;
    PeerId::from_bytes(&bytes).ok()
}

// ============================================================================
// CONFIG
// ============================================================================

/// Peerstore tuning knobs
#[derive(Debug, Clone)]
pub struct PeerstoreConfig {
    /// Address records kept in the in-memory LRU
    pub cache_size: usize,
    /// Cap on a peer's protocol set
    pub max_protocols: usize,
    /// Delay before the first GC pass
    pub gc_initial_delay: Duration,
    /// Interval between GC passes
    pub gc_purge_interval: Duration,
    /// Store operations per GC batch commit
    pub gc_batch_ops: usize,
    /// Private-key encryption settings
    pub keychain: KeychainConfig,
}

impl Default for PeerstoreConfig {
    fn default() -> Self {
        PeerstoreConfig {
            cache_size: 1024,
            max_protocols: 1024,
            gc_initial_delay: Duration::from_secs(60),
            gc_purge_interval: Duration::from_secs(2 * 60 * 60),
            gc_batch_ops: 20,
            keychain: KeychainConfig::default(),
        }
    }
}

// ============================================================================
// PEERSTORE
// ============================================================================

/// The sub-stores bundled behind one handle
pub struct Peerstore {
    config: PeerstoreConfig,
    addr_book: AddressBook,
    key_book: KeyBook,
    proto_book: ProtocolBook,
    metadata: MetadataBook,
    metrics: Metrics,
}

impl Peerstore {
    /// Peerstore over `store`, stamping TTLs with `clock`
    pub fn new(
        store: Arc<dyn KVStore>,
        clock: Arc<dyn Clock>,
        config: PeerstoreConfig,
    ) -> Peerstore {
        Peerstore {
            addr_book: AddressBook::new(store.clone(), clock, config.clone()),
            key_book: KeyBook::new(store.clone(), config.keychain.clone()),
            proto_book: ProtocolBook::new(store.clone(), config.max_protocols),
            metadata: MetadataBook::new(store),
            metrics: Metrics::new(),
            config,
        }
    }

    /// In-memory peerstore with default settings
    pub fn memory() -> Peerstore {
        Peerstore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            PeerstoreConfig::default(),
        )
    }

    /// The address book
    pub fn addr_book(&self) -> &AddressBook {
        &self.addr_book
    }

    /// The key book
    pub fn key_book(&self) -> &KeyBook {
        &self.key_book
    }

    /// The protocol book
    pub fn proto_book(&self) -> &ProtocolBook {
        &self.proto_book
    }

    /// The metadata book
    pub fn metadata(&self) -> &MetadataBook {
        &self.metadata
    }

    /// Latency metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Frequently used delegates, so callers don't have to name sub-books.

    /// See [`AddressBook::addresses`]
    pub async fn addresses(&self, peer: &PeerId) -> Result<Vec<Multiaddr>> {
        self.addr_book.addresses(peer).await
    }

    /// See [`AddressBook::add_addresses`]
    pub async fn add_addresses(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
        ttl: Duration,
    ) -> Result<()> {
        self.addr_book.add_addresses(peer, addrs, ttl).await
    }

    /// See [`ProtocolBook::first_supported`]
    pub async fn first_supported(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<Option<String>> {
        self.proto_book.first_supported(peer, protocols).await
    }

    /// Run the address book GC on its configured cadence until `shutdown`
    /// fires. Delay-first: the initial pass runs after `gc_initial_delay`.
    pub fn spawn_gc(self: &Arc<Self>, shutdown: CancellationToken) {
        let peerstore = self.clone();
        let initial = self.config.gc_initial_delay;
        let interval = self.config.gc_purge_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(initial) => {}
            }
            loop {
                if let Err(e) = peerstore.addr_book.gc_cycle().await {
                    tracing::warn!(error = %e, "address book gc failed");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }
}

impl std::fmt::Debug for Peerstore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peerstore")
            .field("addr_book", &self.addr_book)
            .field("key_book", &self.key_book)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::time::ManualClock;

    #[test]
    fn test_ttl_ordering() {
        assert!(TEMP_ADDR_TTL < RECENTLY_CONNECTED_ADDR_TTL);
        assert!(RECENTLY_CONNECTED_ADDR_TTL < PROVIDER_ADDR_TTL);
        assert!(PROVIDER_ADDR_TTL < PERMANENT_ADDR_TTL);
    }

    #[test]
    fn test_peer_key_roundtrip() {
        let peer = Keypair::generate().peer_id();
        let key = peer_key(ADDRESSES_PREFIX, &peer);
        assert!(key.starts_with(ADDRESSES_PREFIX));
        assert_eq!(peer_from_key(ADDRESSES_PREFIX, &key), Some(peer));

        let sub = format!("{}/private", peer_key(KEYS_PREFIX, &peer));
        assert_eq!(peer_from_key(KEYS_PREFIX, &sub), Some(peer));

        assert_eq!(peer_from_key(ADDRESSES_PREFIX, "/other/x"), None);
    }

    #[tokio::test]
    async fn test_facade_wiring() {
        let peerstore = Peerstore::memory();
        let keypair = Keypair::generate();
        let peer = keypair.peer_id();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();

        peerstore
            .add_addresses(&peer, std::slice::from_ref(&addr), TEMP_ADDR_TTL)
            .await
            .unwrap();
        assert_eq!(peerstore.addresses(&peer).await.unwrap(), vec![addr]);

        peerstore
            .proto_book()
            .add_protocols(&peer, &["/ping/1".to_string()])
            .await
            .unwrap();
        assert_eq!(
            peerstore
                .first_supported(&peer, &["/x".to_string(), "/ping/1".to_string()])
                .await
                .unwrap(),
            Some("/ping/1".to_string())
        );

        peerstore
            .key_book()
            .add_public_key(&peer, &keypair.public())
            .await
            .unwrap();
        assert!(peerstore.key_book().public_key(&peer).await.unwrap().is_some());

        peerstore
            .metrics()
            .record_latency(&peer, Duration::from_millis(3));
        assert!(peerstore.metrics().latency(&peer).is_some());
    }

    #[tokio::test]
    async fn test_gc_task_prunes_on_cadence() {
        let clock = Arc::new(ManualClock::new(10_000));
        let config = PeerstoreConfig {
            gc_initial_delay: Duration::from_millis(10),
            gc_purge_interval: Duration::from_millis(20),
            ..PeerstoreConfig::default()
        };
        let peerstore = Arc::new(Peerstore::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            config,
        ));
        let peer = Keypair::generate().peer_id();
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/1".parse().unwrap();
        peerstore
            .add_addresses(&peer, std::slice::from_ref(&addr), Duration::from_secs(1))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        peerstore.spawn_gc(shutdown.clone());

        clock.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown.cancel();

        assert!(peerstore
            .addr_book()
            .peers_with_addresses()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_backed_peerstore() {
        let peerstore = Peerstore::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(SystemClock),
            PeerstoreConfig::default(),
        );
        let peer = Keypair::generate().peer_id();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();

        peerstore
            .add_addresses(&peer, std::slice::from_ref(&addr), PERMANENT_ADDR_TTL)
            .await
            .unwrap();
        assert_eq!(peerstore.addresses(&peer).await.unwrap(), vec![addr]);
    }
}
