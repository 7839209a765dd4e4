//! Self-certifying peer identifiers.

use std::fmt;
use std::str::FromStr;

use multihash::{Code, Multihash, MultihashDigest};

use crate::error::{Error, Result};
use crate::identity::PublicKey;

/// Marshaled keys up to this many bytes are inlined with the identity
/// multihash; larger keys are hashed with SHA2-256.
const MAX_INLINE_KEY_LEN: usize = 42;

/// Multicodec code for the identity multihash
const CODE_IDENTITY: u64 = 0x00;
/// Multicodec code for SHA2-256
const CODE_SHA2_256: u64 = 0x12;
/// Multicodec code for `libp2p-key`, used in the CIDv1 string form
const CODEC_LIBP2P_KEY: u8 = 0x72;
/// CID version byte for CIDv1
const CID_V1: u8 = 0x01;

/// A content-addressed peer identifier: the multihash of the peer's
/// marshaled public key.
///
/// Two string encodings exist: legacy base58btc of the raw multihash, and
/// CIDv1 with the `libp2p-key` codec in lowercase base32 (prefixed `b`).
/// [`FromStr`] accepts both.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    multihash: Multihash,
}

impl PeerId {
    /// Derive the peer id of a public key
    pub fn from_public_key(key: &PublicKey) -> PeerId {
        let marshaled = key.marshal();
        let multihash = if marshaled.len() <= MAX_INLINE_KEY_LEN {
            Code::Identity.digest(&marshaled)
        } else {
            Code::Sha2_256.digest(&marshaled)
        };
        PeerId { multihash }
    }

    /// Parse a peer id from raw multihash bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<PeerId> {
        let multihash = Multihash::from_bytes(bytes)
            .map_err(|e| Error::InvalidKey(format!("invalid peer id multihash: {e}")))?;
        PeerId::from_multihash(multihash)
    }

    /// Wrap an already-parsed multihash
    pub fn from_multihash(multihash: Multihash) -> Result<PeerId> {
        match multihash.code() {
            CODE_IDENTITY | CODE_SHA2_256 => Ok(PeerId { multihash }),
            other => Err(Error::InvalidKey(format!(
                "peer id multihash must be identity or sha2-256, got code {other:#x}"
            ))),
        }
    }

    /// The raw multihash bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.multihash.to_bytes()
    }

    /// The underlying multihash
    pub fn multihash(&self) -> &Multihash {
        &self.multihash
    }

    /// True iff this id was derived from `key`
    pub fn matches(&self, key: &PublicKey) -> bool {
        PeerId::from_public_key(key) == *self
    }

    /// Legacy base58btc string form
    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }

    /// CIDv1 string form: multibase `b` + lowercase base32 of
    /// `0x01 || libp2p-key || multihash`.
    pub fn to_cid_string(&self) -> String {
        let mut bytes = vec![CID_V1, CODEC_LIBP2P_KEY];
        bytes.extend_from_slice(&self.to_bytes());
        let mut out = String::from("b");
        out.push_str(&data_encoding::BASE32_NOPAD.encode(&bytes).to_lowercase());
        out
    }

    /// Random peer id (tests and stream naming only)
    pub fn random() -> PeerId {
        let digest: [u8; 32] = rand::random();
        PeerId {
            multihash: Code::Sha2_256.digest(&digest),
        }
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<PeerId> {
        if let Some(rest) = s.strip_prefix('b') {
            // CIDv1 form
            let bytes = data_encoding::BASE32_NOPAD
                .decode(rest.to_uppercase().as_bytes())
                .map_err(|e| Error::InvalidKey(format!("invalid base32 peer id: {e}")))?;
            if bytes.len() > 2 && bytes[0] == CID_V1 && bytes[1] == CODEC_LIBP2P_KEY {
                PeerId::from_bytes(&bytes[2..])
            } else {
                Err(Error::InvalidKey(
                    "peer id CID must be v1 with the libp2p-key codec".into(),
                ))
            }
        } else {
            let bytes = bs58::decode(s)
                .into_vec()
                .map_err(|e| Error::InvalidKey(format!("invalid base58 peer id: {e}")))?;
            PeerId::from_bytes(&bytes)
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_base58()).finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn test_peer_id_matches_its_key() {
        let keypair = Keypair::generate();
        let public = keypair.public();
        let peer_id = PeerId::from_public_key(&public);
        assert!(peer_id.matches(&public));

        let other = Keypair::generate().public();
        assert!(!peer_id.matches(&other));
    }

    #[test]
    fn test_small_keys_use_identity_multihash() {
        // Ed25519 marshals to 33 bytes, under the inline threshold
        let public = Keypair::generate().public();
        let peer_id = PeerId::from_public_key(&public);
        assert_eq!(peer_id.multihash().code(), CODE_IDENTITY);
        assert_eq!(peer_id.multihash().digest(), public.marshal().as_slice());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let peer_id = Keypair::generate().peer_id();
        let restored = PeerId::from_bytes(&peer_id.to_bytes()).unwrap();
        assert_eq!(peer_id, restored);
    }

    #[test]
    fn test_base58_roundtrip() {
        let peer_id = Keypair::generate().peer_id();
        let text = peer_id.to_base58();
        let restored: PeerId = text.parse().unwrap();
        assert_eq!(peer_id, restored);
    }

    #[test]
    fn test_cid_roundtrip() {
        let peer_id = Keypair::generate().peer_id();
        let text = peer_id.to_cid_string();
        assert!(text.starts_with('b'));
        let restored: PeerId = text.parse().unwrap();
        assert_eq!(peer_id, restored);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-base58-0OIl".parse::<PeerId>().is_err());
        assert!("b????".parse::<PeerId>().is_err());
        assert!(PeerId::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_equality_is_multihash_equality() {
        let keypair = Keypair::from_seed(&[9u8; 32]);
        let a = keypair.peer_id();
        let b = PeerId::from_bytes(&a.to_bytes()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, PeerId::random());
    }
}
