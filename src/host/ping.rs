//! `/ipfs/ping/1.0.0`: 32-byte challenge/echo round trips.
//!
//! The server side echoes whatever 32-byte block it receives until the
//! stream closes. The client writes a random challenge, expects it back
//! verbatim within 60 seconds, and folds the measured round trip into the
//! peerstore's latency EWMA.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::host::Host;
use crate::identity::PeerId;
use crate::mux::MuxedStream;
use crate::peerstore::Peerstore;

/// Ping protocol id
pub const PROTOCOL_ID: &str = "/ipfs/ping/1.0.0";

/// Challenge size in bytes
pub const PING_SIZE: usize = 32;

/// Per-round-trip deadline
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Install the ping echo handler on `host`
pub(crate) fn register(host: &Host) {
    host.set_stream_handler(PROTOCOL_ID, |peer, stream| serve(peer, stream));
}

/// Echo 32-byte blocks until the peer goes away
async fn serve(peer: PeerId, mut stream: MuxedStream) {
    let mut block = [0u8; PING_SIZE];
    loop {
        if stream.read_exact(&mut block).await.is_err() {
            break;
        }
        if stream.write_all(&block).await.is_err() {
            break;
        }
    }
    tracing::trace!(peer = %peer, "ping stream done");
    let _ = stream.shutdown().await;
}

/// A reusable ping session over one stream
pub struct PingClient {
    peer: PeerId,
    stream: MuxedStream,
    peerstore: Arc<Peerstore>,
}

impl PingClient {
    pub(crate) fn new(peer: PeerId, stream: MuxedStream, peerstore: Arc<Peerstore>) -> PingClient {
        PingClient {
            peer,
            stream,
            peerstore,
        }
    }

    /// One challenge/echo round trip; records the RTT in the peerstore
    pub async fn round(&mut self) -> Result<Duration> {
        let mut challenge = [0u8; PING_SIZE];
        rand::thread_rng().fill(&mut challenge);

        let started = Instant::now();
        let echo = tokio::time::timeout(PING_TIMEOUT, async {
            self.stream.write_all(&challenge).await?;
            let mut echo = [0u8; PING_SIZE];
            self.stream.read_exact(&mut echo).await?;
            Ok::<_, io::Error>(echo)
        })
        .await
        .map_err(|_| Error::Timeout("ping round trip".into()))?
        .map_err(Error::from_stream_io)?;

        if echo != challenge {
            return Err(Error::ProtocolViolation(
                "ping echo does not match challenge".into(),
            ));
        }

        let rtt = started.elapsed();
        self.peerstore.metrics().record_latency(&self.peer, rtt);
        tracing::debug!(peer = %self.peer, ?rtt, "ping");
        Ok(rtt)
    }

    /// Close the session's stream
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for PingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingClient").field("peer", &self.peer).finish()
    }
}
