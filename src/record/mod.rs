//! # Signed Records
//!
//! Domain-separated, signed wrappers around typed payloads.
//!
//! An [`Envelope`] carries a marshaled payload, the payload's type code,
//! the signer's public key and a signature over a domain-separated body:
//!
//! ```text
//! varint(len) || domain || varint(len) || payload_type || varint(len) || payload
//! ```
//!
//! The domain string is fixed per record type, so a signature over one kind
//! of record can never be replayed as another kind. Record types are
//! registered in a [`RecordRegistry`] value (built at startup, no global
//! state), which maps a payload type code back to its domain when consuming
//! envelopes of unknown provenance.

mod peer_record;

pub use peer_record::PeerRecord;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerId, PublicKey};

/// A typed payload that can travel inside an [`Envelope`]
pub trait Record: Sized {
    /// Domain-separation string, fixed per record type
    const DOMAIN: &'static str;
    /// Payload type code carried on the wire
    const CODEC: &'static [u8];

    /// Encode the payload body
    fn marshal_record(&self) -> Result<Vec<u8>>;
    /// Decode the payload body
    fn unmarshal_record(bytes: &[u8]) -> Result<Self>;
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// A signed, domain-separated record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Public key of the signer
    pub public_key: PublicKey,
    /// Payload type code (see [`Record::CODEC`])
    pub payload_type: Vec<u8>,
    /// Marshaled payload
    pub payload: Vec<u8>,
    /// Signature over the domain-separated body
    pub signature: Vec<u8>,
}

/// On-disk / on-wire form of an envelope
#[derive(Serialize, Deserialize)]
struct StoredEnvelope {
    public_key: Vec<u8>,
    payload_type: Vec<u8>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl Envelope {
    /// Sign `record` with `keypair`, producing a sealed envelope
    pub fn seal<R: Record>(record: &R, keypair: &Keypair) -> Result<Envelope> {
        let payload = record.marshal_record()?;
        let body = signed_body(R::DOMAIN, R::CODEC, &payload);
        let signature = keypair.sign(&body);
        Ok(Envelope {
            public_key: keypair.public(),
            payload_type: R::CODEC.to_vec(),
            payload,
            signature,
        })
    }

    /// Verify the signature for the given domain
    pub fn verify(&self, domain: &str) -> Result<()> {
        let body = signed_body(domain, &self.payload_type, &self.payload);
        self.public_key.verify(&body, &self.signature)
    }

    /// Decode the payload as `R`, checking the payload type code.
    ///
    /// Does not verify the signature; callers go through [`Envelope::verify`]
    /// or [`RecordRegistry::consume`] first.
    pub fn record<R: Record>(&self) -> Result<R> {
        if self.payload_type != R::CODEC {
            return Err(Error::InvalidRecord(format!(
                "payload type {:?} does not match expected {:?}",
                self.payload_type,
                R::CODEC
            )));
        }
        R::unmarshal_record(&self.payload)
    }

    /// The peer id of the signing key
    pub fn peer_id(&self) -> PeerId {
        self.public_key.to_peer_id()
    }

    /// Encode the envelope for storage or transfer
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let stored = StoredEnvelope {
            public_key: self.public_key.marshal(),
            payload_type: self.payload_type.clone(),
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        };
        Ok(bincode::serialize(&stored)?)
    }

    /// Decode an envelope produced by [`Envelope::marshal`].
    ///
    /// The signature is not checked here; use [`RecordRegistry::consume`].
    pub fn unmarshal(bytes: &[u8]) -> Result<Envelope> {
        let stored: StoredEnvelope = bincode::deserialize(bytes)?;
        Ok(Envelope {
            public_key: PublicKey::unmarshal(&stored.public_key)?,
            payload_type: stored.payload_type,
            payload: stored.payload,
            signature: stored.signature,
        })
    }
}

/// Build the domain-separated signed body
fn signed_body(domain: &str, payload_type: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(domain.len() + payload_type.len() + payload.len() + 12);
    for part in [domain.as_bytes(), payload_type, payload] {
        let mut buf = unsigned_varint::encode::u64_buffer();
        body.extend_from_slice(unsigned_varint::encode::u64(part.len() as u64, &mut buf));
        body.extend_from_slice(part);
    }
    body
}

// ============================================================================
// RECORD REGISTRY
// ============================================================================

/// Process-local table of known record types.
///
/// Maps a payload type code to its signing domain so that envelopes read
/// from storage or the wire can be verified without knowing their concrete
/// type up front. Built explicitly at startup; there is no ambient global
/// registry.
#[derive(Debug, Default)]
pub struct RecordRegistry {
    domains: HashMap<Vec<u8>, &'static str>,
}

impl RecordRegistry {
    /// Empty registry
    pub fn new() -> RecordRegistry {
        RecordRegistry::default()
    }

    /// Registry with the built-in record types registered
    pub fn with_defaults() -> RecordRegistry {
        let mut registry = RecordRegistry::new();
        registry.register::<PeerRecord>();
        registry
    }

    /// Register a record type
    pub fn register<R: Record>(&mut self) {
        self.domains.insert(R::CODEC.to_vec(), R::DOMAIN);
    }

    /// The domain registered for a payload type code
    pub fn domain_of(&self, payload_type: &[u8]) -> Option<&'static str> {
        self.domains.get(payload_type).copied()
    }

    /// Decode and verify a marshaled envelope.
    ///
    /// The payload type must be registered and the signature must hold for
    /// the registered domain.
    pub fn consume(&self, bytes: &[u8]) -> Result<Envelope> {
        let envelope = Envelope::unmarshal(bytes)?;
        let domain = self.domain_of(&envelope.payload_type).ok_or_else(|| {
            Error::InvalidRecord(format!(
                "unregistered payload type {:?}",
                envelope.payload_type
            ))
        })?;
        envelope.verify(domain)?;
        Ok(envelope)
    }
}

// ============================================================================
// TESTS
// ============================================================================
