//! # Noise Handshake
//!
//! Mutual authentication and channel encryption via
//! `Noise_XX_25519_ChaChaPoly_SHA256`.
//!
//! ## Handshake Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       NOISE XX HANDSHAKE                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   Initiator                                    Responder                │
//! │   ─────────                                    ─────────                │
//! │   message 1:  e                    ──────►     (no payload allowed)     │
//! │   message 2:  ◄──────   e, ee, s, es  +  responder identity proof       │
//! │   message 3:  s, se  +  initiator identity proof   ──────►              │
//! │                                                                         │
//! │   identity proof = { identity_key,                                      │
//! │                      sign("noise-libp2p-static-key:" || static_pub) }   │
//! │                                                                         │
//! │   SPLIT ──► transport cipher states (SecureChannel)                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The Noise static key is ephemeral to the process; the long-lived peer
//! identity key signs it, binding the handshake to the peer id. Every
//! handshake message travels as a 16-bit big-endian length prefix plus
//! body, capped at 8192 bytes. An outbound dial always knows which peer it
//! meant to reach and aborts with [`Error::PeerIdMismatch`] if the proof
//! resolves to anyone else.

mod session;

pub use session::{SecureChannel, MAX_PLAINTEXT_CHUNK};

use serde::{Deserialize, Serialize};
use snow::params::NoiseParams;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerId, PublicKey};

/// Noise protocol profile used by this stack
pub const PROTOCOL_NAME: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Domain prefix of the static-key proof signature
const STATIC_KEY_DOMAIN: &[u8] = b"noise-libp2p-static-key:";

/// Cap on a single handshake message
const MAX_HANDSHAKE_FRAME: usize = 8192;

/// Identity proof exchanged inside the handshake
#[derive(Serialize, Deserialize)]
struct HandshakePayload {
    identity_key: Vec<u8>,
    identity_sig: Vec<u8>,
}

/// Per-process Noise configuration: the identity keypair, a fresh static
/// X25519 keypair, and the pre-computed signed proof binding the two.
pub struct NoiseConfig {
    static_private: Vec<u8>,
    payload: Vec<u8>,
}

impl NoiseConfig {
    /// Generate a static keypair and sign it with `identity`
    pub fn new(identity: &Keypair) -> Result<NoiseConfig> {
        let static_keypair = snow::Builder::new(params()?).generate_keypair()?;

        let mut proof = STATIC_KEY_DOMAIN.to_vec();
        proof.extend_from_slice(&static_keypair.public);
        let payload = bincode::serialize(&HandshakePayload {
            identity_key: identity.public().marshal(),
            identity_sig: identity.sign(&proof),
        })?;

        Ok(NoiseConfig {
            static_private: static_keypair.private,
            payload,
        })
    }
}

impl std::fmt::Debug for NoiseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseConfig").finish_non_exhaustive()
    }
}

fn params() -> Result<NoiseParams> {
    Ok(PROTOCOL_NAME.parse::<NoiseParams>()?)
}

// ============================================================================
// HANDSHAKE DRIVERS
// ============================================================================

/// Run the initiator side of the handshake over `io`.
///
/// `expected` is the peer the dial was addressed to; the handshake aborts
/// before any application bytes flow if the authenticated identity differs.
pub async fn handshake_outbound<T>(
    config: &NoiseConfig,
    mut io: T,
    expected: Option<&PeerId>,
) -> Result<(SecureChannel<T>, PeerId, PublicKey)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = snow::Builder::new(params()?)
        .local_private_key(&config.static_private)
        .build_initiator()?;
    let mut msg_buf = vec![0u8; MAX_HANDSHAKE_FRAME];
    let mut payload_buf = vec![0u8; MAX_HANDSHAKE_FRAME];

    // -> e
    let n = state.write_message(&[], &mut msg_buf)?;
    write_frame(&mut io, &msg_buf[..n]).await?;

    // <- e, ee, s, es + responder proof
    let msg = read_frame(&mut io).await?;
    let n = state.read_message(&msg, &mut payload_buf)?;
    let (remote_id, remote_key) = validate_payload(&state, &payload_buf[..n])?;
    if let Some(expected) = expected {
        if *expected != remote_id {
            return Err(Error::PeerIdMismatch {
                expected: *expected,
                actual: remote_id,
            });
        }
    }

    // -> s, se + initiator proof
    let n = state.write_message(&config.payload, &mut msg_buf)?;
    write_frame(&mut io, &msg_buf[..n]).await?;

    let session = state.into_transport_mode()?;
    tracing::debug!(peer = %remote_id, "outbound noise handshake complete");
    Ok((SecureChannel::new(io, session), remote_id, remote_key))
}

/// Run the responder side of the handshake over `io`
pub async fn handshake_inbound<T>(
    config: &NoiseConfig,
    mut io: T,
) -> Result<(SecureChannel<T>, PeerId, PublicKey)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = snow::Builder::new(params()?)
        .local_private_key(&config.static_private)
        .build_responder()?;
    let mut msg_buf = vec![0u8; MAX_HANDSHAKE_FRAME];
    let mut payload_buf = vec![0u8; MAX_HANDSHAKE_FRAME];

    // <- e
    let msg = read_frame(&mut io).await?;
    let n = state.read_message(&msg, &mut payload_buf)?;
    if n != 0 {
        return Err(Error::Handshake(
            "unexpected payload in first handshake message".into(),
        ));
    }

    // -> e, ee, s, es + responder proof
    let n = state.write_message(&config.payload, &mut msg_buf)?;
    write_frame(&mut io, &msg_buf[..n]).await?;

    // <- s, se + initiator proof
    let msg = read_frame(&mut io).await?;
    let n = state.read_message(&msg, &mut payload_buf)?;
    let (remote_id, remote_key) = validate_payload(&state, &payload_buf[..n])?;

    let session = state.into_transport_mode()?;
    tracing::debug!(peer = %remote_id, "inbound noise handshake complete");
    Ok((SecureChannel::new(io, session), remote_id, remote_key))
}

/// Check the identity proof against the remote's static DH key
fn validate_payload(
    state: &snow::HandshakeState,
    payload: &[u8],
) -> Result<(PeerId, PublicKey)> {
    let payload: HandshakePayload = bincode::deserialize(payload)
        .map_err(|e| Error::Handshake(format!("malformed handshake payload: {e}")))?;
    let identity_key = PublicKey::unmarshal(&payload.identity_key)
        .map_err(|e| Error::Handshake(format!("bad identity key in handshake: {e}")))?;

    let remote_static = state
        .get_remote_static()
        .ok_or_else(|| Error::Handshake("remote static key not yet available".into()))?;
    let mut proof = STATIC_KEY_DOMAIN.to_vec();
    proof.extend_from_slice(remote_static);
    identity_key
        .verify(&proof, &payload.identity_sig)
        .map_err(|_| Error::Handshake("invalid static key signature".into()))?;

    Ok((identity_key.to_peer_id(), identity_key))
}

// ============================================================================
// MESSAGE FRAMING
// ============================================================================

async fn write_frame<T>(io: &mut T, frame: &[u8]) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    debug_assert!(frame.len() <= MAX_HANDSHAKE_FRAME);
    io.write_all(&(frame.len() as u16).to_be_bytes()).await?;
    io.write_all(frame).await?;
    io.flush().await?;
    Ok(())
}

async fn read_frame<T>(io: &mut T) -> Result<Vec<u8>>
where
    T: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    io.read_exact(&mut len_buf).await.map_err(eof_in_handshake)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_HANDSHAKE_FRAME {
        return Err(Error::Handshake(format!(
            "handshake message of {len} bytes exceeds {MAX_HANDSHAKE_FRAME}"
        )));
    }
    let mut frame = vec![0u8; len];
    io.read_exact(&mut frame).await.map_err(eof_in_handshake)?;
    Ok(frame)
}

fn eof_in_handshake(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Handshake("connection closed mid-handshake".into())
    } else {
        Error::Io(err)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn handshake_pair(
        expected: Option<PeerId>,
    ) -> (
        Result<(SecureChannel<tokio::io::DuplexStream>, PeerId, PublicKey)>,
        Result<(SecureChannel<tokio::io::DuplexStream>, PeerId, PublicKey)>,
        Keypair,
        Keypair,
    ) {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let alice_cfg = NoiseConfig::new(&alice).unwrap();
        let bob_cfg = NoiseConfig::new(&bob).unwrap();

        let (alice_io, bob_io) = tokio::io::duplex(64 * 1024);
        let inbound = tokio::spawn(async move { handshake_inbound(&bob_cfg, bob_io).await });
        let outbound =
            handshake_outbound(&alice_cfg, alice_io, expected.as_ref()).await;
        (outbound, inbound.await.unwrap(), alice, bob)
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let (outbound, inbound, alice, bob) = handshake_pair(None).await;

        let (_, bob_id, bob_key) = outbound.unwrap();
        assert_eq!(bob_id, bob.peer_id());
        assert!(bob_id.matches(&bob_key));

        let (_, alice_id, _) = inbound.unwrap();
        assert_eq!(alice_id, alice.peer_id());
    }

    #[tokio::test]
    async fn test_handshake_with_expected_peer() {
        let bob = Keypair::generate();
        let alice_cfg = NoiseConfig::new(&Keypair::generate()).unwrap();
        let bob_cfg = NoiseConfig::new(&bob).unwrap();
        let bob_id = bob.peer_id();

        let (alice_io, bob_io) = tokio::io::duplex(64 * 1024);
        let inbound = tokio::spawn(async move { handshake_inbound(&bob_cfg, bob_io).await });
        let outbound = handshake_outbound(&alice_cfg, alice_io, Some(&bob_id)).await;

        assert!(outbound.is_ok());
        assert!(inbound.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_peer_id_mismatch_aborts() {
        let stranger = Keypair::generate().peer_id();
        let (outbound, _inbound, _, bob) = handshake_pair(Some(stranger)).await;

        match outbound {
            Err(Error::PeerIdMismatch { expected, actual }) => {
                assert_eq!(expected, stranger);
                assert_eq!(actual, bob.peer_id());
            }
            other => panic!("expected PeerIdMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_secure_channel_carries_data() {
        let (outbound, inbound, _, _) = handshake_pair(None).await;
        let (mut alice_channel, ..) = outbound.unwrap();
        let (mut bob_channel, ..) = inbound.unwrap();

        alice_channel.write_all(b"ping").await.unwrap();
        alice_channel.flush().await.unwrap();
        let mut buf = [0u8; 4];
        bob_channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        bob_channel.write_all(b"pong").await.unwrap();
        bob_channel.flush().await.unwrap();
        alice_channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_responder_rejects_payload_in_first_message() {
        let bob_cfg = NoiseConfig::new(&Keypair::generate()).unwrap();
        let (mut alice_io, bob_io) = tokio::io::duplex(64 * 1024);

        let inbound = tokio::spawn(async move { handshake_inbound(&bob_cfg, bob_io).await });

        // A hand-driven initiator that smuggles a payload into message 1.
        let mut state = snow::Builder::new(params().unwrap())
            .local_private_key(&snow::Builder::new(params().unwrap()).generate_keypair().unwrap().private)
            .build_initiator()
            .unwrap();
        let mut msg = vec![0u8; 1024];
        let n = state.write_message(b"sneaky", &mut msg).unwrap();
        write_frame(&mut alice_io, &msg[..n]).await.unwrap();

        let result = inbound.await.unwrap();
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn test_eof_mid_handshake() {
        let bob_cfg = NoiseConfig::new(&Keypair::generate()).unwrap();
        let (alice_io, bob_io) = tokio::io::duplex(64 * 1024);
        drop(alice_io);

        let result = handshake_inbound(&bob_cfg, bob_io).await;
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn test_oversize_handshake_frame_rejected() {
        let bob_cfg = NoiseConfig::new(&Keypair::generate()).unwrap();
        let (mut alice_io, bob_io) = tokio::io::duplex(64 * 1024);

        let inbound = tokio::spawn(async move { handshake_inbound(&bob_cfg, bob_io).await });
        // Length prefix larger than the cap.
        alice_io
            .write_all(&(MAX_HANDSHAKE_FRAME as u16 + 1).to_be_bytes())
            .await
            .unwrap();

        let result = inbound.await.unwrap();
        assert!(matches!(result, Err(Error::Handshake(_))));
    }
}
