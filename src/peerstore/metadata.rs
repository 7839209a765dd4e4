//! Metadata book: typed per-peer key/value storage.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::identity::PeerId;
use crate::peerstore::store::KVStore;
use crate::peerstore::{peer_key, METADATA_PREFIX};

/// Arbitrary typed values attached to a peer, serialized with bincode
pub struct MetadataBook {
    store: Arc<dyn KVStore>,
}

impl MetadataBook {
    pub(crate) fn new(store: Arc<dyn KVStore>) -> MetadataBook {
        MetadataBook { store }
    }

    fn path(peer: &PeerId, key: &str) -> String {
        format!("{}/{}", peer_key(METADATA_PREFIX, peer), key)
    }

    /// Store `value` under `key` for `peer`
    pub async fn put<T: Serialize>(&self, peer: &PeerId, key: &str, value: &T) -> Result<()> {
        self.store
            .put(&Self::path(peer, key), bincode::serialize(value)?)
            .await
    }

    /// Fetch the value under `key` for `peer`
    pub async fn get<T: DeserializeOwned>(&self, peer: &PeerId, key: &str) -> Result<Option<T>> {
        match self.store.get(&Self::path(peer, key)).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove the value under `key` for `peer`
    pub async fn delete(&self, peer: &PeerId, key: &str) -> Result<()> {
        self.store.delete(&Self::path(peer, key)).await
    }

    /// Remove everything stored for `peer`
    pub async fn clear(&self, peer: &PeerId) -> Result<()> {
        let prefix = format!("{}/", peer_key(METADATA_PREFIX, peer));
        for (key, _) in self.store.query_prefix(&prefix).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MetadataBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataBook").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::peerstore::store::MemoryStore;

    fn book() -> MetadataBook {
        MetadataBook::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let book = book();
        let peer = Keypair::generate().peer_id();

        book.put(&peer, "agent", &"braid/0.1.0".to_string()).await.unwrap();
        book.put(&peer, "score", &42u32).await.unwrap();

        assert_eq!(
            book.get::<String>(&peer, "agent").await.unwrap(),
            Some("braid/0.1.0".to_string())
        );
        assert_eq!(book.get::<u32>(&peer, "score").await.unwrap(), Some(42));
        assert_eq!(book.get::<u32>(&peer, "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_type_errors() {
        let book = book();
        let peer = Keypair::generate().peer_id();
        book.put(&peer, "text", &"hello".to_string()).await.unwrap();
        assert!(book.get::<u64>(&peer, "text").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let book = book();
        let peer = Keypair::generate().peer_id();
        book.put(&peer, "a", &1u8).await.unwrap();
        book.put(&peer, "b", &2u8).await.unwrap();

        book.delete(&peer, "a").await.unwrap();
        assert_eq!(book.get::<u8>(&peer, "a").await.unwrap(), None);

        book.clear(&peer).await.unwrap();
        assert_eq!(book.get::<u8>(&peer, "b").await.unwrap(), None);
    }
}
