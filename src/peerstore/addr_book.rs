//! Address book: per-peer address sets with TTLs and certified records.
//!
//! Every peer maps to one record holding `address -> (expires_at, ttl)`
//! plus, optionally, the latest signed [`PeerRecord`] envelope and its
//! sequence number. Records live in the backing [`KVStore`] under
//! `/peers/addresses/<b32(peer)>` with a bounded in-memory LRU in front.
//! Mutations hold a per-peer async lock; a background GC pass drops
//! expired addresses and evicts empty records in small store batches.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::address;
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::peerstore::store::KVStore;
use crate::peerstore::{peer_from_key, peer_key, PeerstoreConfig, ADDRESSES_PREFIX};
use crate::record::{Envelope, PeerRecord, Record};
use crate::time::Clock;

/// One address lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AddressEntry {
    expires_at: u64,
    ttl: u64,
}

/// In-memory form of a peer's record
#[derive(Debug, Clone, Default)]
struct AddressRecord {
    addrs: HashMap<Multiaddr, AddressEntry>,
    certified: Option<Vec<u8>>,
    certified_seq: u64,
    /// Cache filtered entries the store has not seen yet
    dirty: bool,
}

impl AddressRecord {
    fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.certified.is_none()
    }

    /// Drop expired addresses; true when something was removed
    fn prune(&mut self, now: u64) -> bool {
        let before = self.addrs.len();
        self.addrs.retain(|_, entry| entry.expires_at > now);
        self.addrs.len() != before
    }
}

/// Serialized form
#[derive(Serialize, Deserialize)]
struct StoredAddressRecord {
    addrs: Vec<(Vec<u8>, u64, u64)>,
    certified: Option<Vec<u8>>,
    certified_seq: u64,
}

impl StoredAddressRecord {
    fn from_record(record: &AddressRecord) -> StoredAddressRecord {
        StoredAddressRecord {
            addrs: record
                .addrs
                .iter()
                .map(|(addr, entry)| (addr.to_vec(), entry.expires_at, entry.ttl))
                .collect(),
            certified: record.certified.clone(),
            certified_seq: record.certified_seq,
        }
    }

    fn into_record(self) -> Result<AddressRecord> {
        let mut addrs = HashMap::with_capacity(self.addrs.len());
        for (raw, expires_at, ttl) in self.addrs {
            let addr = Multiaddr::try_from(raw)?;
            addrs.insert(addr, AddressEntry { expires_at, ttl });
        }
        Ok(AddressRecord {
            addrs,
            certified: self.certified,
            certified_seq: self.certified_seq,
            dirty: false,
        })
    }
}

/// Outcome of one GC pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Whole records deleted
    pub records_removed: usize,
    /// Individual expired addresses dropped
    pub addrs_dropped: usize,
}

// ============================================================================
// ADDRESS BOOK
// ============================================================================

/// TTL'd address book over a [`KVStore`]
pub struct AddressBook {
    store: Arc<dyn KVStore>,
    clock: Arc<dyn Clock>,
    config: PeerstoreConfig,
    cache: Mutex<LruCache<PeerId, AddressRecord>>,
    locks: Mutex<HashMap<PeerId, Arc<AsyncMutex<()>>>>,
}

impl AddressBook {
    pub(crate) fn new(
        store: Arc<dyn KVStore>,
        clock: Arc<dyn Clock>,
        config: PeerstoreConfig,
    ) -> AddressBook {
        let cache_size = NonZeroUsize::new(config.cache_size.max(1)).expect("max(1) is nonzero");
        AddressBook {
            store,
            clock,
            config,
            cache: Mutex::new(LruCache::new(cache_size)),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn record_lock(&self, peer: &PeerId) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(*peer).or_default().clone()
    }

    async fn load(&self, peer: &PeerId) -> Result<AddressRecord> {
        if let Some(record) = self.cache.lock().get(peer) {
            return Ok(record.clone());
        }
        let record = match self.store.get(&peer_key(ADDRESSES_PREFIX, peer)).await? {
            Some(bytes) => bincode::deserialize::<StoredAddressRecord>(&bytes)?.into_record()?,
            None => AddressRecord::default(),
        };
        self.cache.lock().put(*peer, record.clone());
        Ok(record)
    }

    async fn persist(&self, peer: &PeerId, mut record: AddressRecord) -> Result<()> {
        let key = peer_key(ADDRESSES_PREFIX, peer);
        if record.is_empty() {
            self.store.delete(&key).await?;
            self.cache.lock().pop(peer);
        } else {
            record.dirty = false;
            let bytes = bincode::serialize(&StoredAddressRecord::from_record(&record))?;
            self.store.put(&key, bytes).await?;
            self.cache.lock().put(*peer, record);
        }
        Ok(())
    }

    /// Reject addresses carrying some other peer's `/p2p` suffix and strip
    /// a matching one.
    fn strip_peer_id(peer: &PeerId, addr: &Multiaddr) -> Result<Multiaddr> {
        let (base, id) = address::split_peer_id(addr);
        match id {
            Some(id) if id != *peer => Err(Error::InvalidAddress(format!(
                "address {addr} names peer {id}, not {peer}"
            ))),
            _ => Ok(base),
        }
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        ttl.as_millis().min(u64::MAX as u128) as u64
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Record `addr` for `peer`, extending any existing lease to at least
    /// `now + ttl`. A zero TTL is a no-op.
    pub async fn add_address(&self, peer: &PeerId, addr: &Multiaddr, ttl: Duration) -> Result<()> {
        self.add_addresses(peer, std::slice::from_ref(addr), ttl).await
    }

    /// [`AddressBook::add_address`] over a batch of addresses
    pub async fn add_addresses(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
        ttl: Duration,
    ) -> Result<()> {
        let ttl = Self::ttl_millis(ttl);
        if ttl == 0 {
            return Ok(());
        }
        let lock = self.record_lock(peer);
        let _guard = lock.lock().await;

        let mut record = self.load(peer).await?;
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(ttl);
        for addr in addrs {
            let addr = Self::strip_peer_id(peer, addr)?;
            let entry = record
                .addrs
                .entry(addr)
                .or_insert(AddressEntry { expires_at: 0, ttl });
            if expires_at > entry.expires_at {
                *entry = AddressEntry { expires_at, ttl };
            }
        }
        self.persist(peer, record).await
    }

    /// Set the lease of exactly the given addresses: each one is inserted
    /// or re-stamped with `ttl`, and removed when `ttl` is zero. Addresses
    /// not listed keep their existing expiry.
    pub async fn set_addresses(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
        ttl: Duration,
    ) -> Result<()> {
        let ttl = Self::ttl_millis(ttl);
        let lock = self.record_lock(peer);
        let _guard = lock.lock().await;

        let mut record = self.load(peer).await?;
        let now = self.clock.now_millis();
        for addr in addrs {
            let addr = Self::strip_peer_id(peer, addr)?;
            if ttl == 0 {
                record.addrs.remove(&addr);
            } else {
                record.addrs.insert(
                    addr,
                    AddressEntry {
                        expires_at: now.saturating_add(ttl),
                        ttl,
                    },
                );
            }
        }
        self.persist(peer, record).await
    }

    /// Re-stamp every lease currently carrying `old_ttl` with `new_ttl`
    pub async fn update_addresses(
        &self,
        peer: &PeerId,
        old_ttl: Duration,
        new_ttl: Duration,
    ) -> Result<()> {
        let old_ttl = Self::ttl_millis(old_ttl);
        let new_ttl = Self::ttl_millis(new_ttl);
        let lock = self.record_lock(peer);
        let _guard = lock.lock().await;

        let mut record = self.load(peer).await?;
        let now = self.clock.now_millis();
        for entry in record.addrs.values_mut() {
            if entry.ttl == old_ttl {
                *entry = AddressEntry {
                    expires_at: now.saturating_add(new_ttl),
                    ttl: new_ttl,
                };
            }
        }
        record.addrs.retain(|_, entry| entry.ttl != 0);
        self.persist(peer, record).await
    }

    /// Forget everything about `peer`
    pub async fn clear_addresses(&self, peer: &PeerId) -> Result<()> {
        let lock = self.record_lock(peer);
        let _guard = lock.lock().await;
        self.store.delete(&peer_key(ADDRESSES_PREFIX, peer)).await?;
        self.cache.lock().pop(peer);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Live (unexpired) addresses of `peer`
    pub async fn addresses(&self, peer: &PeerId) -> Result<Vec<Multiaddr>> {
        let mut record = self.load(peer).await?;
        let now = self.clock.now_millis();
        if record.prune(now) {
            // The store still holds the expired entries; GC reconciles.
            record.dirty = true;
            self.cache.lock().put(*peer, record.clone());
        }
        Ok(record.addrs.keys().cloned().collect())
    }

    /// Peers with at least one live address
    pub async fn peers_with_addresses(&self) -> Result<Vec<PeerId>> {
        let now = self.clock.now_millis();
        let mut peers = Vec::new();
        for (key, bytes) in self.store.query_prefix(ADDRESSES_PREFIX).await? {
            let Some(peer) = peer_from_key(ADDRESSES_PREFIX, &key) else {
                continue;
            };
            let Ok(stored) = bincode::deserialize::<StoredAddressRecord>(&bytes) else {
                continue;
            };
            if stored.addrs.iter().any(|(_, expires_at, _)| *expires_at > now) {
                peers.push(peer);
            }
        }
        Ok(peers)
    }

    // ------------------------------------------------------------------
    // Certified records
    // ------------------------------------------------------------------

    /// Accept a signed address record if it advances the stored sequence
    /// number. On acceptance the peer's address set is replaced by the
    /// record's addresses, each leased for `ttl`. Returns whether the
    /// record was accepted.
    pub async fn consume_peer_record(&self, envelope: &Envelope, ttl: Duration) -> Result<bool> {
        envelope.verify(PeerRecord::DOMAIN)?;
        let peer_record: PeerRecord = envelope.record()?;
        if envelope.peer_id() != peer_record.peer_id {
            return Err(Error::InvalidRecord(format!(
                "peer record for {} signed by {}",
                peer_record.peer_id,
                envelope.peer_id()
            )));
        }

        let peer = peer_record.peer_id;
        let ttl = Self::ttl_millis(ttl);
        let lock = self.record_lock(&peer);
        let _guard = lock.lock().await;

        let mut record = self.load(&peer).await?;
        if peer_record.seq <= record.certified_seq && record.certified.is_some() {
            tracing::debug!(peer = %peer, seq = peer_record.seq, "stale peer record ignored");
            return Ok(false);
        }

        let now = self.clock.now_millis();
        let mut addrs = HashMap::with_capacity(peer_record.addresses.len());
        for addr in &peer_record.addresses {
            let addr = Self::strip_peer_id(&peer, addr)?;
            addrs.insert(
                addr,
                AddressEntry {
                    expires_at: now.saturating_add(ttl),
                    ttl,
                },
            );
        }
        record.addrs = addrs;
        record.certified = Some(envelope.marshal()?);
        record.certified_seq = peer_record.seq;
        self.persist(&peer, record).await?;
        Ok(true)
    }

    /// The current certified envelope for `peer`, if any
    pub async fn get_peer_record(&self, peer: &PeerId) -> Result<Option<Envelope>> {
        let record = self.load(peer).await?;
        match record.certified {
            Some(bytes) => Ok(Some(Envelope::unmarshal(&bytes)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// One GC pass: walk all records, drop expired addresses and delete
    /// empty records, committing in batches of at most
    /// `config.gc_batch_ops` store operations.
    pub async fn gc_cycle(&self) -> Result<GcStats> {
        let now = self.clock.now_millis();
        let mut stats = GcStats::default();
        let mut batch = self.store.batch();

        for (key, bytes) in self.store.query_prefix(ADDRESSES_PREFIX).await? {
            let Some(peer) = peer_from_key(ADDRESSES_PREFIX, &key) else {
                continue;
            };
            let lock = self.record_lock(&peer);
            let _guard = lock.lock().await;

            let mut record = match bincode::deserialize::<StoredAddressRecord>(&bytes) {
                Ok(stored) => match stored.into_record() {
                    Ok(record) => record,
                    Err(_) => AddressRecord::default(),
                },
                // Undecodable records are dropped rather than kept forever.
                Err(_) => AddressRecord::default(),
            };

            let before = record.addrs.len();
            record.prune(now);
            stats.addrs_dropped += before - record.addrs.len();

            if record.addrs.is_empty() {
                batch.delete(key);
                self.cache.lock().pop(&peer);
                stats.records_removed += 1;
            } else if record.addrs.len() != before {
                let bytes = bincode::serialize(&StoredAddressRecord::from_record(&record))?;
                batch.put(key, bytes);
                self.cache.lock().put(peer, record);
            }

            if batch.len() >= self.config.gc_batch_ops {
                batch.commit().await?;
                batch = self.store.batch();
            }
        }
        if !batch.is_empty() {
            batch.commit().await?;
        }
        if stats.records_removed > 0 || stats.addrs_dropped > 0 {
            tracing::debug!(?stats, "address book gc pass");
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for AddressBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressBook")
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
