//! # Peer Identity
//!
//! Identity keypairs and the self-certifying peer identifier derived from
//! them.
//!
//! A peer's identity is an Ed25519 keypair. The public key marshals to a
//! small tagged byte string, and the [`PeerId`] is a multihash over those
//! marshaled bytes: keys short enough to inline use the identity multihash,
//! anything larger is hashed with SHA2-256. Knowing a `PeerId` is enough to
//! verify that a presented public key really is the peer's key.

mod peer_id;

pub use peer_id::PeerId;

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Supported key algorithms.
///
/// Only Ed25519 keys can currently be constructed; the remaining tags
/// reserve marshaling space for other algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    /// RSA (reserved)
    Rsa = 0,
    /// Ed25519
    Ed25519 = 1,
    /// secp256k1 ECDSA (reserved)
    Secp256k1 = 2,
    /// NIST P-256 ECDSA (reserved)
    Ecdsa = 3,
}

impl KeyType {
    fn from_tag(tag: u8) -> Option<KeyType> {
        match tag {
            0 => Some(KeyType::Rsa),
            1 => Some(KeyType::Ed25519),
            2 => Some(KeyType::Secp256k1),
            3 => Some(KeyType::Ecdsa),
            _ => None,
        }
    }
}

// ============================================================================
// PUBLIC KEY
// ============================================================================

/// A peer's public identity key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Ed25519 verifying key
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl PublicKey {
    /// The algorithm of this key
    pub fn key_type(&self) -> KeyType {
        match self {
            PublicKey::Ed25519(_) => KeyType::Ed25519,
        }
    }

    /// Marshal to the tagged byte form: one algorithm tag byte followed by
    /// the raw key bytes.
    pub fn marshal(&self) -> Vec<u8> {
        match self {
            PublicKey::Ed25519(key) => {
                let mut out = Vec::with_capacity(33);
                out.push(KeyType::Ed25519 as u8);
                out.extend_from_slice(key.as_bytes());
                out
            }
        }
    }

    /// Parse the tagged byte form produced by [`PublicKey::marshal`]
    pub fn unmarshal(bytes: &[u8]) -> Result<PublicKey> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::InvalidKey("empty key bytes".into()))?;
        match KeyType::from_tag(tag) {
            Some(KeyType::Ed25519) => {
                let raw: [u8; 32] = rest
                    .try_into()
                    .map_err(|_| Error::InvalidKey(format!("ed25519 key must be 32 bytes, got {}", rest.len())))?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map_err(|e| Error::InvalidKey(e.to_string()))?;
                Ok(PublicKey::Ed25519(key))
            }
            Some(other) => Err(Error::InvalidKey(format!("unsupported key type {other:?}"))),
            None => Err(Error::InvalidKey(format!("unknown key type tag {tag}"))),
        }
    }

    /// Verify `signature` over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            PublicKey::Ed25519(key) => {
                let raw: [u8; SIGNATURE_SIZE] = signature
                    .try_into()
                    .map_err(|_| Error::InvalidSignature)?;
                let sig = ed25519_dalek::Signature::from_bytes(&raw);
                key.verify(message, &sig).map_err(|_| Error::InvalidSignature)
            }
        }
    }

    /// The peer id this key hashes to
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

// ============================================================================
// KEYPAIR
// ============================================================================

/// A peer's identity keypair
#[derive(Clone)]
pub enum Keypair {
    /// Ed25519 signing key
    Ed25519(ed25519_dalek::SigningKey),
}

impl Keypair {
    /// Generate a fresh Ed25519 keypair
    pub fn generate() -> Keypair {
        Keypair::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng))
    }

    /// Deterministic Ed25519 keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Keypair {
        Keypair::Ed25519(ed25519_dalek::SigningKey::from_bytes(seed))
    }

    /// The algorithm of this keypair
    pub fn key_type(&self) -> KeyType {
        match self {
            Keypair::Ed25519(_) => KeyType::Ed25519,
        }
    }

    /// The public half
    pub fn public(&self) -> PublicKey {
        match self {
            Keypair::Ed25519(key) => PublicKey::Ed25519(key.verifying_key()),
        }
    }

    /// The peer id of the public half
    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    /// Sign `message`, returning the raw signature bytes
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Keypair::Ed25519(key) => key.sign(message).to_bytes().to_vec(),
        }
    }

    /// Marshal the secret half to the tagged byte form
    pub fn marshal(&self) -> Vec<u8> {
        match self {
            Keypair::Ed25519(key) => {
                let mut out = Vec::with_capacity(33);
                out.push(KeyType::Ed25519 as u8);
                out.extend_from_slice(key.as_bytes());
                out
            }
        }
    }

    /// Parse the tagged byte form produced by [`Keypair::marshal`]
    pub fn unmarshal(bytes: &[u8]) -> Result<Keypair> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::InvalidKey("empty key bytes".into()))?;
        match KeyType::from_tag(tag) {
            Some(KeyType::Ed25519) => {
                let raw: [u8; 32] = rest
                    .try_into()
                    .map_err(|_| Error::InvalidKey(format!("ed25519 seed must be 32 bytes, got {}", rest.len())))?;
                Ok(Keypair::Ed25519(ed25519_dalek::SigningKey::from_bytes(&raw)))
            }
            Some(other) => Err(Error::InvalidKey(format!("unsupported key type {other:?}"))),
            None => Err(Error::InvalidKey(format!("unknown key type tag {tag}"))),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Keypair::Ed25519(key) => f
                .debug_struct("Keypair")
                .field("type", &KeyType::Ed25519)
                .field("public", &hex::encode(key.verifying_key().as_bytes()))
                .finish(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::generate();
        let message = b"hello world";

        let sig = keypair.sign(message);
        assert!(keypair.public().verify(message, &sig).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_message() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"original");
        assert!(matches!(
            keypair.public().verify(b"tampered", &sig),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let sig = alice.sign(b"message");
        assert!(bob.public().verify(b"message", &sig).is_err());
    }

    #[test]
    fn test_public_key_marshal_roundtrip() {
        let keypair = Keypair::generate();
        let public = keypair.public();

        let bytes = public.marshal();
        assert_eq!(bytes[0], KeyType::Ed25519 as u8);
        assert_eq!(bytes.len(), 33);

        let restored = PublicKey::unmarshal(&bytes).unwrap();
        assert_eq!(public, restored);
    }

    #[test]
    fn test_keypair_marshal_roundtrip() {
        let keypair = Keypair::from_seed(&[7u8; 32]);
        let restored = Keypair::unmarshal(&keypair.marshal()).unwrap();
        assert_eq!(keypair.public(), restored.public());
    }

    #[test]
    fn test_unmarshal_rejects_bad_input() {
        assert!(PublicKey::unmarshal(&[]).is_err());
        assert!(PublicKey::unmarshal(&[99, 1, 2, 3]).is_err());
        assert!(PublicKey::unmarshal(&[KeyType::Ed25519 as u8, 1, 2]).is_err());
        // Reserved algorithm tags parse as "unsupported", not "unknown"
        assert!(matches!(
            PublicKey::unmarshal(&[KeyType::Rsa as u8, 0, 0]),
            Err(Error::InvalidKey(msg)) if msg.contains("unsupported")
        ));
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = Keypair::from_seed(&[42u8; 32]);
        let b = Keypair::from_seed(&[42u8; 32]);
        assert_eq!(a.public(), b.public());
        assert_eq!(a.peer_id(), b.peer_id());
    }
}
