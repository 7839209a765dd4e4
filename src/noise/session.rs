//! Encrypted channel over an established Noise session.
//!
//! Wire format: every frame is a 16-bit big-endian length followed by that
//! many ciphertext bytes. One Noise message carries at most 65535 bytes, of
//! which 16 are the AEAD tag, so plaintext is chunked at 65519 bytes and
//! larger writes split across frames. A failed decryption is fatal and
//! surfaces as an `InvalidData` I/O error, which closes the connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest Noise message, tag included
pub const MAX_FRAME_SIZE: usize = 65535;
/// AEAD tag length
pub const TAG_SIZE: usize = 16;
/// Largest plaintext chunk per frame
pub const MAX_PLAINTEXT_CHUNK: usize = MAX_FRAME_SIZE - TAG_SIZE;

/// Stop accepting writes while this much ciphertext is waiting to flush
const MAX_WRITE_BUFFER: usize = 2 * (MAX_FRAME_SIZE + 2);

enum ReadState {
    /// Reading the 2-byte length prefix
    Len { buf: [u8; 2], filled: usize },
    /// Reading `len` ciphertext bytes
    Body { len: usize, filled: usize },
}

/// Encrypting/decrypting wrapper around a raw connection.
///
/// Reads decrypt with the receiving cipher state, writes encrypt with the
/// sending one; the two directions are independent.
pub struct SecureChannel<T> {
    io: T,
    session: snow::TransportState,
    read_state: ReadState,
    cipher_buf: Vec<u8>,
    plain_buf: Vec<u8>,
    decrypted: BytesMut,
    write_buf: BytesMut,
}

impl<T> SecureChannel<T> {
    /// Wrap `io` with the post-handshake transport state
    pub fn new(io: T, session: snow::TransportState) -> SecureChannel<T> {
        SecureChannel {
            io,
            session,
            read_state: ReadState::Len {
                buf: [0u8; 2],
                filled: 0,
            },
            cipher_buf: vec![0u8; MAX_FRAME_SIZE],
            plain_buf: vec![0u8; MAX_FRAME_SIZE],
            decrypted: BytesMut::new(),
            write_buf: BytesMut::new(),
        }
    }
}

impl<T> SecureChannel<T>
where
    T: AsyncWrite + Unpin,
{
    /// Push pending ciphertext into the inner writer. `Ok(true)` means the
    /// buffer is fully drained; `Ok(false)` means the inner writer is not
    /// ready and has registered the waker.
    fn flush_buffer(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match Pin::new(&mut self.io).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "secure channel write returned zero",
                    ));
                }
                Poll::Ready(Ok(n)) => {
                    self.write_buf.advance(n);
                }
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl<T> AsyncRead for SecureChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.decrypted.is_empty() {
                let n = buf.remaining().min(this.decrypted.len());
                buf.put_slice(&this.decrypted.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Len { buf: len_buf, filled } => {
                    let mut rb = ReadBuf::new(&mut len_buf[*filled..]);
                    match Pin::new(&mut this.io).poll_read(cx, &mut rb) {
                        Poll::Ready(Ok(())) => {
                            let n = rb.filled().len();
                            if n == 0 {
                                return if *filled == 0 {
                                    // Clean EOF at a frame boundary.
                                    Poll::Ready(Ok(()))
                                } else {
                                    Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                                };
                            }
                            *filled += n;
                            if *filled == 2 {
                                let len = u16::from_be_bytes(*len_buf) as usize;
                                this.read_state = if len == 0 {
                                    ReadState::Len {
                                        buf: [0u8; 2],
                                        filled: 0,
                                    }
                                } else {
                                    ReadState::Body { len, filled: 0 }
                                };
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Body { len, filled } => {
                    let mut rb = ReadBuf::new(&mut this.cipher_buf[*filled..*len]);
                    match Pin::new(&mut this.io).poll_read(cx, &mut rb) {
                        Poll::Ready(Ok(())) => {
                            let n = rb.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                            }
                            *filled += n;
                            if *filled == *len {
                                let len = *len;
                                let n = this
                                    .session
                                    .read_message(&this.cipher_buf[..len], &mut this.plain_buf)
                                    .map_err(|e| {
                                        io::Error::new(
                                            io::ErrorKind::InvalidData,
                                            format!("decryption failed: {e}"),
                                        )
                                    })?;
                                this.decrypted.extend_from_slice(&this.plain_buf[..n]);
                                this.read_state = ReadState::Len {
                                    buf: [0u8; 2],
                                    filled: 0,
                                };
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl<T> AsyncWrite for SecureChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Opportunistically drain, and push back once too much ciphertext
        // is parked.
        if let Err(e) = this.flush_buffer(cx) {
            return Poll::Ready(Err(e));
        }
        if this.write_buf.len() >= MAX_WRITE_BUFFER {
            // Waker registered by the inner poll_write.
            return Poll::Pending;
        }

        let chunk = data.len().min(MAX_PLAINTEXT_CHUNK);
        let n = this
            .session
            .write_message(&data[..chunk], &mut this.plain_buf)
            .map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("encryption failed: {e}"))
            })?;
        this.write_buf.put_u16(n as u16);
        this.write_buf.extend_from_slice(&this.plain_buf[..n]);
        Poll::Ready(Ok(chunk))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.flush_buffer(cx) {
            Ok(true) => Pin::new(&mut this.io).poll_flush(cx),
            Ok(false) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.flush_buffer(cx) {
            Ok(true) => Pin::new(&mut this.io).poll_shutdown(cx),
            Ok(false) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<T> std::fmt::Debug for SecureChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("decrypted", &self.decrypted.len())
            .field("pending_write", &self.write_buf.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Run the XX handshake purely in memory and return the two transport
    /// states.
    fn session_pair() -> (snow::TransportState, snow::TransportState) {
        let params: snow::params::NoiseParams =
            "Noise_XX_25519_ChaChaPoly_SHA256".parse().unwrap();
        let init_keys = snow::Builder::new(params.clone()).generate_keypair().unwrap();
        let resp_keys = snow::Builder::new(params.clone()).generate_keypair().unwrap();

        let mut initiator = snow::Builder::new(params.clone())
            .local_private_key(&init_keys.private)
            .build_initiator()
            .unwrap();
        let mut responder = snow::Builder::new(params)
            .local_private_key(&resp_keys.private)
            .build_responder()
            .unwrap();

        let mut msg = vec![0u8; 1024];
        let mut scratch = vec![0u8; 1024];
        let n = initiator.write_message(&[], &mut msg).unwrap();
        responder.read_message(&msg[..n], &mut scratch).unwrap();
        let n = responder.write_message(&[], &mut msg).unwrap();
        initiator.read_message(&msg[..n], &mut scratch).unwrap();
        let n = initiator.write_message(&[], &mut msg).unwrap();
        responder.read_message(&msg[..n], &mut scratch).unwrap();

        (
            initiator.into_transport_mode().unwrap(),
            responder.into_transport_mode().unwrap(),
        )
    }

    fn channel_pair() -> (
        SecureChannel<tokio::io::DuplexStream>,
        SecureChannel<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (init, resp) = session_pair();
        (SecureChannel::new(a, init), SecureChannel::new(b, resp))
    }

    #[tokio::test]
    async fn test_roundtrip_small() {
        let (mut alice, mut bob) = channel_pair();

        alice.write_all(b"hello bob").await.unwrap();
        alice.flush().await.unwrap();

        let mut buf = [0u8; 9];
        bob.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello bob");

        bob.write_all(b"hello alice").await.unwrap();
        bob.flush().await.unwrap();
        let mut buf = [0u8; 11];
        alice.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello alice");
    }

    #[tokio::test]
    async fn test_large_write_splits_frames() {
        let (mut alice, mut bob) = channel_pair();

        // Larger than one noise frame: must split at 65519 bytes.
        let payload: Vec<u8> = (0..200_000usize).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            alice.write_all(&payload).await.unwrap();
            alice.flush().await.unwrap();
            alice
        });

        let mut received = vec![0u8; expected.len()];
        bob.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_ciphertext_differs_from_plaintext() {
        let (mut alice, raw) = {
            let (a, b) = tokio::io::duplex(1024 * 1024);
            let (init, _resp) = session_pair();
            (SecureChannel::new(a, init), b)
        };

        alice.write_all(b"super secret payload").await.unwrap();
        alice.flush().await.unwrap();

        let mut raw = raw;
        let mut wire = vec![0u8; 64];
        let n = raw.read(&mut wire).await.unwrap();
        assert!(n > 2);
        // Frame is length-prefixed and carries no plaintext.
        let len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(len, 20 + TAG_SIZE);
        assert!(!wire[..n]
            .windows(b"secret".len())
            .any(|w| w == b"secret"));
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_fatal() {
        let (mut alice, bob_raw) = {
            let (a, b) = tokio::io::duplex(1024 * 1024);
            let (init, resp) = session_pair();
            (SecureChannel::new(a, init), (b, resp))
        };
        let (mut raw, resp) = bob_raw;

        alice.write_all(b"data").await.unwrap();
        alice.flush().await.unwrap();

        // Flip a ciphertext byte in transit.
        let mut wire = vec![0u8; 64];
        let n = raw.read(&mut wire).await.unwrap();
        wire[2] ^= 0xff;

        let (c, d) = tokio::io::duplex(1024);
        let mut corrupted = SecureChannel::new(d, resp);
        let mut c = c;
        c.write_all(&wire[..n]).await.unwrap();

        let mut buf = [0u8; 4];
        let err = corrupted.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (alice, mut bob) = channel_pair();
        drop(alice);

        let mut buf = Vec::new();
        let n = bob.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let (raw, resp) = {
            let (_a, b) = tokio::io::duplex(1024);
            let (_init, resp) = session_pair();
            (b, resp)
        };
        drop(raw);

        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut channel = SecureChannel::new(reader, resp);
        // Length prefix promising 100 bytes, then EOF.
        writer.write_all(&[0u8, 100, 1, 2, 3]).await.unwrap();
        drop(writer);

        let mut buf = [0u8; 8];
        let err = channel.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
