//! Protocol book: which protocol ids each peer is known to speak.
//!
//! Sets are bounded (default 1024 ids per peer) and guarded by 256 lock
//! shards keyed by the peer id hash, so unrelated peers never contend.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::peerstore::store::KVStore;
use crate::peerstore::{peer_key, PROTOCOLS_PREFIX};

const SHARDS: usize = 256;

/// Per-peer protocol sets over a [`KVStore`]
pub struct ProtocolBook {
    store: Arc<dyn KVStore>,
    shards: Vec<AsyncMutex<()>>,
    max_protocols: usize,
}

impl ProtocolBook {
    pub(crate) fn new(store: Arc<dyn KVStore>, max_protocols: usize) -> ProtocolBook {
        ProtocolBook {
            store,
            shards: (0..SHARDS).map(|_| AsyncMutex::new(())).collect(),
            max_protocols,
        }
    }

    fn shard(&self, peer: &PeerId) -> &AsyncMutex<()> {
        let mut hasher = DefaultHasher::new();
        peer.hash(&mut hasher);
        &self.shards[(hasher.finish() % SHARDS as u64) as usize]
    }

    async fn load(&self, peer: &PeerId) -> Result<BTreeSet<String>> {
        match self.store.get(&peer_key(PROTOCOLS_PREFIX, peer)).await? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn persist(&self, peer: &PeerId, set: &BTreeSet<String>) -> Result<()> {
        let key = peer_key(PROTOCOLS_PREFIX, peer);
        if set.is_empty() {
            self.store.delete(&key).await
        } else {
            self.store.put(&key, bincode::serialize(set)?).await
        }
    }

    /// Add protocol ids to a peer's set
    pub async fn add_protocols(&self, peer: &PeerId, protocols: &[String]) -> Result<()> {
        let _guard = self.shard(peer).lock().await;
        let mut set = self.load(peer).await?;
        for proto in protocols {
            set.insert(proto.clone());
            if set.len() > self.max_protocols {
                return Err(Error::TooManyProtocols);
            }
        }
        self.persist(peer, &set).await
    }

    /// Replace a peer's set
    pub async fn set_protocols(&self, peer: &PeerId, protocols: &[String]) -> Result<()> {
        if protocols.len() > self.max_protocols {
            return Err(Error::TooManyProtocols);
        }
        let _guard = self.shard(peer).lock().await;
        let set: BTreeSet<String> = protocols.iter().cloned().collect();
        self.persist(peer, &set).await
    }

    /// Remove protocol ids from a peer's set
    pub async fn remove_protocols(&self, peer: &PeerId, protocols: &[String]) -> Result<()> {
        let _guard = self.shard(peer).lock().await;
        let mut set = self.load(peer).await?;
        for proto in protocols {
            set.remove(proto);
        }
        self.persist(peer, &set).await
    }

    /// Everything the peer is known to speak
    pub async fn protocols(&self, peer: &PeerId) -> Result<Vec<String>> {
        Ok(self.load(peer).await?.into_iter().collect())
    }

    /// The subset of `protocols` the peer is known to speak, in the order
    /// given
    pub async fn supported_protocols(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<Vec<String>> {
        let set = self.load(peer).await?;
        Ok(protocols
            .iter()
            .filter(|p| set.contains(*p))
            .cloned()
            .collect())
    }

    /// First of `protocols` the peer is known to speak
    pub async fn first_supported(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<Option<String>> {
        let set = self.load(peer).await?;
        Ok(protocols.iter().find(|p| set.contains(*p)).cloned())
    }

    /// Forget a peer's protocols
    pub async fn clear_protocols(&self, peer: &PeerId) -> Result<()> {
        let _guard = self.shard(peer).lock().await;
        self.store.delete(&peer_key(PROTOCOLS_PREFIX, peer)).await
    }
}

impl std::fmt::Debug for ProtocolBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBook")
            .field("max_protocols", &self.max_protocols)
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
    use crate::peerstore::store::MemoryStore;

    fn book(max: usize) -> ProtocolBook {
        ProtocolBook::new(Arc::new(MemoryStore::new()), max)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_and_query() {
        let book = book(1024);
        let peer = Keypair::generate().peer_id();

        book.add_protocols(&peer, &ids(&["/ping/1", "/chat/1"])).await.unwrap();
        book.add_protocols(&peer, &ids(&["/ping/1"])).await.unwrap(); // dedupe

        let all = book.protocols(&peer).await.unwrap();
        assert_eq!(all, ids(&["/chat/1", "/ping/1"]));

        assert_eq!(
            book.supported_protocols(&peer, &ids(&["/x/1", "/ping/1"])).await.unwrap(),
            ids(&["/ping/1"])
        );
        assert_eq!(
            book.first_supported(&peer, &ids(&["/x/1", "/chat/1", "/ping/1"]))
                .await
                .unwrap(),
            Some("/chat/1".to_string())
        );
        assert_eq!(
            book.first_supported(&peer, &ids(&["/x/1"])).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_set_and_remove() {
        let book = book(1024);
        let peer = Keypair::generate().peer_id();

        book.set_protocols(&peer, &ids(&["/a/1", "/b/1"])).await.unwrap();
        book.remove_protocols(&peer, &ids(&["/a/1"])).await.unwrap();
        assert_eq!(book.protocols(&peer).await.unwrap(), ids(&["/b/1"]));

        book.clear_protocols(&peer).await.unwrap();
        assert!(book.protocols(&peer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bound_enforced() {
        let book = book(3);
        let peer = Keypair::generate().peer_id();

        book.add_protocols(&peer, &ids(&["/a/1", "/b/1", "/c/1"])).await.unwrap();
        assert!(matches!(
            book.add_protocols(&peer, &ids(&["/d/1"])).await,
            Err(Error::TooManyProtocols)
        ));
        assert!(book.set_protocols(&peer, &ids(&["/a", "/b", "/c", "/d"])).await.is_err());
    }

    #[tokio::test]
    async fn test_peers_are_independent() {
        let book = book(1024);
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();

        book.add_protocols(&a, &ids(&["/a/1"])).await.unwrap();
        assert!(book.protocols(&b).await.unwrap().is_empty());
    }
}
