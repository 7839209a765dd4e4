//! # Braid
//!
//! A modular peer-to-peer networking stack: independently addressed peers
//! establish bidirectional, multiplexed, authenticated, encrypted
//! byte-stream channels and run application protocols over them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            BRAID STACK                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Host          stream handler table · multistream negotiation   │   │
//! │  │                built-in ping · event bus                        │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │                                         │
//! │  ┌────────────────────────────▼────────────────────────────────────┐   │
//! │  │  Swarm         dialer (ranking, retry, backoff) · listeners     │   │
//! │  │                connection ownership · gater      ◄── Peerstore  │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │                                         │
//! │  ┌────────────────────────────▼────────────────────────────────────┐   │
//! │  │  Muxer         frame codec · per-stream flow control            │   │
//! │  │                open / half-close / reset                        │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │                                         │
//! │  ┌────────────────────────────▼────────────────────────────────────┐   │
//! │  │  Noise         XX handshake · signed static-key proof           │   │
//! │  │                split cipher states (SecureChannel)              │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │                                         │
//! │  ┌────────────────────────────▼────────────────────────────────────┐   │
//! │  │  Transport     TCP dial / listen                                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire stack
//! - [`identity`] - Keypairs and self-certifying peer ids
//! - [`address`] - Multiaddress projection helpers
//! - [`record`] - Signed, domain-separated records (envelopes)
//! - [`multistream`] - In-band protocol negotiation
//! - [`mux`] - Stream multiplexer and frame codec
//! - [`noise`] - Noise XX handshake and secure channel
//! - [`transport`] - Transport trait, TCP, connection upgrader
//! - [`peerstore`] - Address/key/protocol/metadata books and metrics
//! - [`swarm`] - Dialer, listeners, connection management
//! - [`host`] - Handler table, stream opening, ping
//! - [`bus`] - Typed publish/subscribe event bus
//!
//! ## Example
//!
//! ```ignore
//! use braid::{Host, HostConfig, Keypair};
//!
//! let host = Host::new(&Keypair::generate(), HostConfig {
//!     listen_addrs: vec!["/ip4/0.0.0.0/tcp/0".parse()?],
//!     ..HostConfig::default()
//! })?;
//! host.start().await?;
//!
//! host.set_stream_handler("/chat/1.0.0", |peer, stream| async move {
//!     // speak the protocol
//! });
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod address;
pub mod bus;
pub mod error;
pub mod host;
pub mod identity;
pub mod multistream;
pub mod mux;
pub mod noise;
pub mod peerstore;
pub mod record;
pub mod swarm;
/// Time utilities and the injectable clock.
pub mod time;
pub mod transport;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use address::AddressInfo;
pub use bus::EventBus;
pub use error::{DialError, Error, ErrorKind, Result};
pub use host::{Host, HostConfig};
pub use identity::{Keypair, PeerId, PublicKey};
pub use mux::{MuxedStream, MuxerConfig};
pub use peerstore::{Peerstore, PeerstoreConfig};
pub use record::{Envelope, PeerRecord, RecordRegistry};
pub use swarm::{ConnectionGater, Swarm, SwarmConfig};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
