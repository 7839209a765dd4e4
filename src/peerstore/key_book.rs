//! Key book: public keys of known peers and the local private keys.
//!
//! Public keys are stored as-is; private keys are encrypted at rest with
//! AES-256-GCM under a PBKDF2-derived key when the keychain has a
//! password. The digest backing PBKDF2 is selectable (sha1, sha256,
//! sha512) and the whole keychain can be re-encrypted under a new
//! password.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerId, PublicKey};
use crate::peerstore::store::KVStore;
use crate::peerstore::{peer_key, KEYS_PREFIX};

/// PBKDF2 digest choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KdfHash {
    /// PBKDF2-HMAC-SHA1
    Sha1,
    /// PBKDF2-HMAC-SHA256 (default)
    #[default]
    Sha256,
    /// PBKDF2-HMAC-SHA512
    Sha512,
}

impl KdfHash {
    fn tag(self) -> u8 {
        match self {
            KdfHash::Sha1 => 1,
            KdfHash::Sha256 => 2,
            KdfHash::Sha512 => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<KdfHash> {
        match tag {
            1 => Ok(KdfHash::Sha1),
            2 => Ok(KdfHash::Sha256),
            3 => Ok(KdfHash::Sha512),
            other => Err(Error::InvalidKey(format!("unknown kdf hash tag {other}"))),
        }
    }
}

/// Keychain encryption settings
#[derive(Clone)]
pub struct KeychainConfig {
    /// Password protecting stored private keys; `None` stores them
    /// unencrypted.
    pub pass: Option<String>,
    /// PBKDF2 digest
    pub hash: KdfHash,
    /// PBKDF2 iteration count
    pub rounds: u32,
}

impl Default for KeychainConfig {
    fn default() -> Self {
        KeychainConfig {
            pass: None,
            hash: KdfHash::Sha256,
            rounds: 10_000,
        }
    }
}

impl std::fmt::Debug for KeychainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeychainConfig")
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("hash", &self.hash)
            .field("rounds", &self.rounds)
            .finish()
    }
}

/// Stored private-key envelope
#[derive(Serialize, Deserialize)]
struct StoredPrivateKey {
    /// `None` when stored unencrypted
    kdf: Option<StoredKdf>,
    nonce: Vec<u8>,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredKdf {
    hash: u8,
    rounds: u32,
    salt: Vec<u8>,
}

// ============================================================================
// KEY BOOK
// ============================================================================

/// Public/private key storage keyed by peer id
pub struct KeyBook {
    store: Arc<dyn KVStore>,
    config: RwLock<KeychainConfig>,
}

impl KeyBook {
    pub(crate) fn new(store: Arc<dyn KVStore>, config: KeychainConfig) -> KeyBook {
        KeyBook {
            store,
            config: RwLock::new(config),
        }
    }

    fn public_key_path(peer: &PeerId) -> String {
        format!("{}/public", peer_key(KEYS_PREFIX, peer))
    }

    fn private_key_path(peer: &PeerId) -> String {
        format!("{}/private", peer_key(KEYS_PREFIX, peer))
    }

    /// Store a peer's public key; the key must hash to the peer id
    pub async fn add_public_key(&self, peer: &PeerId, key: &PublicKey) -> Result<()> {
        if !peer.matches(key) {
            return Err(Error::InvalidKey(format!(
                "public key does not belong to peer {peer}"
            )));
        }
        self.store
            .put(&Self::public_key_path(peer), key.marshal())
            .await
    }

    /// Fetch a peer's public key
    pub async fn public_key(&self, peer: &PeerId) -> Result<Option<PublicKey>> {
        match self.store.get(&Self::public_key_path(peer)).await? {
            Some(bytes) => Ok(Some(PublicKey::unmarshal(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a local keypair (public key included), encrypting the private
    /// half per the keychain config.
    pub async fn add_keypair(&self, peer: &PeerId, keypair: &Keypair) -> Result<()> {
        self.add_public_key(peer, &keypair.public()).await?;
        let sealed = seal_private_key(&self.config.read(), keypair)?;
        self.store
            .put(&Self::private_key_path(peer), bincode::serialize(&sealed)?)
            .await
    }

    /// Fetch and decrypt a stored keypair
    pub async fn keypair(&self, peer: &PeerId) -> Result<Option<Keypair>> {
        match self.store.get(&Self::private_key_path(peer)).await? {
            Some(bytes) => {
                let stored: StoredPrivateKey = bincode::deserialize(&bytes)?;
                Ok(Some(open_private_key(&self.config.read(), &stored)?))
            }
            None => Ok(None),
        }
    }

    /// Forget a peer's keys
    pub async fn clear_keys(&self, peer: &PeerId) -> Result<()> {
        self.store.delete(&Self::public_key_path(peer)).await?;
        self.store.delete(&Self::private_key_path(peer)).await
    }

    /// Re-encrypt every stored private key under a new keychain password
    pub async fn rotate_keychain_pass(&self, new: KeychainConfig) -> Result<()> {
        let old = self.config.read().clone();
        for (key, bytes) in self.store.query_prefix(KEYS_PREFIX).await? {
            if !key.ends_with("/private") {
                continue;
            }
            let stored: StoredPrivateKey = bincode::deserialize(&bytes)?;
            let keypair = open_private_key(&old, &stored)?;
            let resealed = seal_private_key(&new, &keypair)?;
            self.store.put(&key, bincode::serialize(&resealed)?).await?;
        }
        *self.config.write() = new;
        tracing::info!("keychain password rotated");
        Ok(())
    }
}

impl std::fmt::Debug for KeyBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBook")
            .field("encrypted", &self.config.read().pass.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SEALING
// ============================================================================

fn derive_key(hash: KdfHash, rounds: u32, pass: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    match hash {
        KdfHash::Sha1 => pbkdf2::pbkdf2_hmac::<sha1::Sha1>(pass.as_bytes(), salt, rounds, &mut key),
        KdfHash::Sha256 => {
            pbkdf2::pbkdf2_hmac::<sha2::Sha256>(pass.as_bytes(), salt, rounds, &mut key)
        }
        KdfHash::Sha512 => {
            pbkdf2::pbkdf2_hmac::<sha2::Sha512>(pass.as_bytes(), salt, rounds, &mut key)
        }
    }
    key
}

fn seal_private_key(config: &KeychainConfig, keypair: &Keypair) -> Result<StoredPrivateKey> {
    let marshaled = keypair.marshal();
    let Some(pass) = &config.pass else {
        return Ok(StoredPrivateKey {
            kdf: None,
            nonce: Vec::new(),
            data: marshaled,
        });
    };

    let salt: [u8; 16] = rand::random();
    let nonce: [u8; 12] = rand::random();
    let mut key = derive_key(config.hash, config.rounds, pass, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let data = cipher
        .encrypt(Nonce::from_slice(&nonce), marshaled.as_slice())
        .map_err(|_| Error::InvalidKey("private key encryption failed".into()))?;
    key.zeroize();

    Ok(StoredPrivateKey {
        kdf: Some(StoredKdf {
            hash: config.hash.tag(),
            rounds: config.rounds,
            salt: salt.to_vec(),
        }),
        nonce: nonce.to_vec(),
        data,
    })
}

fn open_private_key(config: &KeychainConfig, stored: &StoredPrivateKey) -> Result<Keypair> {
    let Some(kdf) = &stored.kdf else {
        return Keypair::unmarshal(&stored.data);
    };
    let pass = config
        .pass
        .as_deref()
        .ok_or_else(|| Error::InvalidKey("keychain password required".into()))?;

    let mut key = derive_key(KdfHash::from_tag(kdf.hash)?, kdf.rounds, pass, &kdf.salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plain = cipher
        .decrypt(Nonce::from_slice(&stored.nonce), stored.data.as_slice())
        .map_err(|_| Error::InvalidKey("private key decryption failed (wrong password?)".into()))?;
    key.zeroize();
    Keypair::unmarshal(&plain)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peerstore::store::MemoryStore;

    fn keybook(config: KeychainConfig) -> KeyBook {
        KeyBook::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_public_key_roundtrip() {
        let book = keybook(KeychainConfig::default());
        let keypair = Keypair::generate();
        let peer = keypair.peer_id();

        assert!(book.public_key(&peer).await.unwrap().is_none());
        book.add_public_key(&peer, &keypair.public()).await.unwrap();
        assert_eq!(book.public_key(&peer).await.unwrap(), Some(keypair.public()));
    }

    #[tokio::test]
    async fn test_mismatched_public_key_rejected() {
        let book = keybook(KeychainConfig::default());
        let peer = Keypair::generate().peer_id();
        let wrong = Keypair::generate().public();
        assert!(book.add_public_key(&peer, &wrong).await.is_err());
    }

    #[tokio::test]
    async fn test_private_key_plaintext_roundtrip() {
        let book = keybook(KeychainConfig::default());
        let keypair = Keypair::generate();
        let peer = keypair.peer_id();

        book.add_keypair(&peer, &keypair).await.unwrap();
        let restored = book.keypair(&peer).await.unwrap().unwrap();
        assert_eq!(restored.public(), keypair.public());
    }

    #[tokio::test]
    async fn test_private_key_encrypted_roundtrip() {
        for hash in [KdfHash::Sha1, KdfHash::Sha256, KdfHash::Sha512] {
            let book = keybook(KeychainConfig {
                pass: Some("correct horse".into()),
                hash,
                rounds: 100,
            });
            let keypair = Keypair::generate();
            let peer = keypair.peer_id();

            book.add_keypair(&peer, &keypair).await.unwrap();
            let restored = book.keypair(&peer).await.unwrap().unwrap();
            assert_eq!(restored.public(), keypair.public());
        }
    }

    #[tokio::test]
    async fn test_wrong_password_fails() {
        let book = keybook(KeychainConfig {
            pass: Some("right".into()),
            rounds: 100,
            ..KeychainConfig::default()
        });
        let keypair = Keypair::generate();
        let peer = keypair.peer_id();
        book.add_keypair(&peer, &keypair).await.unwrap();

        *book.config.write() = KeychainConfig {
            pass: Some("wrong".into()),
            rounds: 100,
            ..KeychainConfig::default()
        };
        assert!(book.keypair(&peer).await.is_err());
    }

    #[tokio::test]
    async fn test_rotate_keychain_pass() {
        let book = keybook(KeychainConfig {
            pass: Some("first".into()),
            rounds: 100,
            ..KeychainConfig::default()
        });
        let a = Keypair::generate();
        let b = Keypair::generate();
        book.add_keypair(&a.peer_id(), &a).await.unwrap();
        book.add_keypair(&b.peer_id(), &b).await.unwrap();

        book.rotate_keychain_pass(KeychainConfig {
            pass: Some("second".into()),
            hash: KdfHash::Sha512,
            rounds: 200,
        })
        .await
        .unwrap();

        assert_eq!(
            book.keypair(&a.peer_id()).await.unwrap().unwrap().public(),
            a.public()
        );
        assert_eq!(
            book.keypair(&b.peer_id()).await.unwrap().unwrap().public(),
            b.public()
        );
    }

    #[tokio::test]
    async fn test_clear_keys() {
        let book = keybook(KeychainConfig::default());
        let keypair = Keypair::generate();
        let peer = keypair.peer_id();
        book.add_keypair(&peer, &keypair).await.unwrap();

        book.clear_keys(&peer).await.unwrap();
        assert!(book.public_key(&peer).await.unwrap().is_none());
        assert!(book.keypair(&peer).await.unwrap().is_none());
    }
}
