//! # Error Handling
//!
//! Error types for the whole stack.
//!
//! ## Error Categories
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR CATEGORIES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                      │
//! │  │                                                                      │
//! │  ├── Wire protocol      ProtocolViolation, NegotiationFailed            │
//! │  ├── Handshake          Handshake, PeerIdMismatch                       │
//! │  ├── Identity/records   InvalidKey, InvalidSignature, InvalidRecord     │
//! │  ├── Streams            StreamReset, Closed, Timeout                    │
//! │  ├── Dialing            NoAddresses, Dial, GaterDenied                  │
//! │  ├── Peerstore          NotFound, TooManyProtocols, Storage             │
//! │  └── Plumbing           Io, Serialization, InvalidAddress               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Fatal errors close the affected stream or connection and are never
//! retried; the dialer is the only component that retries, and it does so
//! per address with its own backoff policy.

use std::io;

use thiserror::Error;

use crate::identity::PeerId;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the networking stack
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Wire protocol errors
    // ========================================================================
    /// A peer violated a wire protocol (malformed varint, bad frame tag,
    /// oversize message, wrong negotiation header, ...). Fatal to the
    /// offending stream or connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Protocol negotiation ran out of candidates
    #[error("protocol negotiation failed: no mutually supported protocol")]
    NegotiationFailed,

    // ========================================================================
    // Handshake errors
    // ========================================================================
    /// The Noise handshake failed (bad state, oversize message, bad
    /// signature, EOF mid-handshake). Fatal to the connection.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The authenticated remote peer is not the peer we meant to reach
    #[error("peer id mismatch: expected {expected}, connected to {actual}")]
    PeerIdMismatch {
        /// Peer id the dialer asked for
        expected: PeerId,
        /// Peer id proven by the remote's handshake payload
        actual: PeerId,
    },

    // ========================================================================
    // Identity & record errors
    // ========================================================================
    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signature verification failed
    #[error("invalid signature")]
    InvalidSignature,

    /// A signed record was malformed or not acceptable
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Address could not be parsed or projected
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    // ========================================================================
    // Stream errors
    // ========================================================================
    /// The peer reset the stream. Both halves are failed; never retried
    /// inside the muxer.
    #[error("stream reset by remote")]
    StreamReset,

    /// The local component was shut down; callers should not retry
    #[error("closed")]
    Closed,

    /// An operation timed out
    #[error("timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Dialing errors
    // ========================================================================
    /// The peerstore holds no addresses for the peer
    #[error("no known addresses for peer {0}")]
    NoAddresses(PeerId),

    /// Every address attempt failed; carries the per-address causes
    #[error("{0}")]
    Dial(DialError),

    /// The connection gater rejected the peer or connection; not retried
    #[error("connection denied by gater")]
    GaterDenied,

    // ========================================================================
    // Peerstore errors
    // ========================================================================
    /// Peerstore key absent
    #[error("not found: {0}")]
    NotFound(String),

    /// The per-peer protocol set is full
    #[error("protocol set is full")]
    TooManyProtocols,

    /// Backing key-value store failure
    #[error("storage error: {0}")]
    Storage(String),

    // ========================================================================
    // Plumbing
    // ========================================================================
    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a stored/transferred structure failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse error kind, used in events and assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wire protocol violation
    ProtocolViolation,
    /// Negotiation exhausted
    NegotiationFailed,
    /// Handshake failure (including peer-id mismatch)
    Handshake,
    /// Key / signature / record problem
    InvalidRecord,
    /// Bad address
    InvalidAddress,
    /// Remote stream reset
    StreamReset,
    /// Local shutdown
    Closed,
    /// Timeout
    Timeout,
    /// Dial failure (no addresses or all attempts failed)
    Dial,
    /// Gater rejection
    GaterDenied,
    /// Missing peerstore entry
    NotFound,
    /// Peerstore policy bound hit
    PeerstoreBound,
    /// Storage backend failure
    Storage,
    /// Raw I/O failure
    Io,
    /// Serialization failure
    Serialization,
}

impl Error {
    /// The coarse kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Error::NegotiationFailed => ErrorKind::NegotiationFailed,
            Error::Handshake(_) | Error::PeerIdMismatch { .. } => ErrorKind::Handshake,
            Error::InvalidKey(_) | Error::InvalidSignature | Error::InvalidRecord(_) => {
                ErrorKind::InvalidRecord
            }
            Error::InvalidAddress(_) => ErrorKind::InvalidAddress,
            Error::StreamReset => ErrorKind::StreamReset,
            Error::Closed => ErrorKind::Closed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::NoAddresses(_) | Error::Dial(_) => ErrorKind::Dial,
            Error::GaterDenied => ErrorKind::GaterDenied,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::TooManyProtocols => ErrorKind::PeerstoreBound,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Map an `io::Error` coming off a muxed-stream or secure-channel seam
    /// back to the crate-level error it encodes.
    ///
    /// Stream layers implement `AsyncRead`/`AsyncWrite` and therefore speak
    /// `io::Error`; `StreamReset` travels as `ConnectionReset` and `Closed`
    /// as `BrokenPipe`/`NotConnected`.
    pub fn from_stream_io(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::ConnectionReset => Error::StreamReset,
            io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => Error::Closed,
            io::ErrorKind::TimedOut => Error::Timeout("stream i/o".into()),
            _ => Error::Io(err),
        }
    }
}

// ============================================================================
// DIAL ERROR AGGREGATION
// ============================================================================

/// Cap on distinct (address, cause) pairs carried by a [`DialError`]
pub const MAX_DIAL_ERRORS: usize = 16;

/// Aggregated outcome of a failed dial across all attempted addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialError {
    /// Per-address causes, capped at [`MAX_DIAL_ERRORS`]
    pub attempts: Vec<(multiaddr::Multiaddr, String)>,
    /// How many further causes were dropped once the cap was hit
    pub skipped: usize,
}

impl DialError {
    /// Record one failed attempt, dropping it if the cap is reached
    pub fn push(&mut self, addr: multiaddr::Multiaddr, cause: String) {
        if self.attempts.len() < MAX_DIAL_ERRORS {
            self.attempts.push((addr, cause));
        } else {
            self.skipped += 1;
        }
    }

    /// True when no attempt was recorded
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all dial attempts failed:")?;
        for (addr, cause) in &self.attempts {
            write!(f, " [{addr}: {cause}]")?;
        }
        if self.skipped > 0 {
            write!(f, " (skipped {} more)", self.skipped)?;
        }
        Ok(())
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<snow::Error> for Error {
    fn from(err: snow::Error) -> Self {
        Error::Handshake(err.to_string())
    }
}

impl From<multiaddr::Error> for Error {
    fn from(err: multiaddr::Error) -> Self {
        Error::InvalidAddress(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
