//! # Stream Muxer
//!
//! Multiplexes many logical byte streams over one reliable connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            MUXER                                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   MuxedStream ──write──► frame queue ──► write task ──► connection     │
//! │   MuxedStream ◄──read─── input queue ◄── demux task ◄── connection     │
//! │                                                                         │
//! │   demux task:  NewStream ──► accept queue                              │
//! │                Message   ──► per-stream input queue (5 s slow-reader   │
//! │                              window, stream reset on overrun)          │
//! │                Close     ──► input EOF (writes still allowed)          │
//! │                Reset     ──► fail both halves, drop from table         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A stream is identified by `(initiator, id)` where `initiator` tells
//! which side opened it; ids are allocated per side from a monotonic
//! counter, so the pair is unique per connection. Half-close is explicit:
//! closing the write side still allows reads, and a stream is dropped from
//! the table once both directions are done or either side resets.

pub mod frame;

pub use frame::{Frame, FrameFlag, MplexCodec, DEFAULT_MAX_PAYLOAD};

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, PollSender};

use crate::error::{Error, Result};

/// Muxer tuning knobs
#[derive(Debug, Clone)]
pub struct MuxerConfig {
    /// Cap on a single frame payload
    pub max_frame_size: usize,
    /// Outbound frame queue depth
    pub outbound_queue: usize,
    /// Per-stream inbound queue depth, in frames
    pub stream_queue: usize,
    /// Accept queue depth for remotely opened streams
    pub accept_queue: usize,
    /// How long an inbound frame may wait for a slow reader before the
    /// stream is reset
    pub slow_reader_timeout: Duration,
    /// Largest chunk a single stream write turns into one frame
    pub write_chunk: usize,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        MuxerConfig {
            max_frame_size: DEFAULT_MAX_PAYLOAD,
            outbound_queue: 16,
            stream_queue: 32,
            accept_queue: 32,
            slow_reader_timeout: Duration::from_secs(5),
            write_chunk: 64 * 1024,
        }
    }
}

/// `(initiator, id)` pair naming a stream, from the local perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StreamKey {
    initiator: bool,
    id: u64,
}

/// Flags shared between a stream handle and the muxer tasks
#[derive(Debug, Default)]
struct StreamState {
    reset: AtomicBool,
    write_closed: AtomicBool,
}

struct StreamEntry {
    /// Feeds the stream's input queue; `None` once the remote half-closed
    data_tx: Option<mpsc::Sender<Bytes>>,
    state: Arc<StreamState>,
}

struct MuxerShared {
    label: String,
    streams: Mutex<HashMap<StreamKey, StreamEntry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl MuxerShared {
    /// Fail and forget every stream. Used on muxer shutdown.
    fn reset_all(&self) {
        let mut streams = self.streams.lock();
        for entry in streams.values() {
            entry.state.reset.store(true, Ordering::Release);
        }
        streams.clear();
    }

    /// Fail and forget one stream
    fn reset_stream(&self, key: StreamKey) {
        let mut streams = self.streams.lock();
        if let Some(entry) = streams.remove(&key) {
            entry.state.reset.store(true, Ordering::Release);
        }
    }

    /// Drop the table entry once both directions are done
    fn remove_if_finished(&self, key: StreamKey) {
        let mut streams = self.streams.lock();
        if let Some(entry) = streams.get(&key) {
            if entry.data_tx.is_none() && entry.state.write_closed.load(Ordering::Acquire) {
                streams.remove(&key);
            }
        }
    }
}

// ============================================================================
// MUXER
// ============================================================================

/// Per-connection stream multiplexer.
///
/// Owns the demux/write tasks for one connection; dropped or closed, it
/// resets every stream and closes the underlying connection.
pub struct Muxer {
    shared: Arc<MuxerShared>,
    frame_tx: mpsc::Sender<Frame>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxedStream>>,
    shutdown: CancellationToken,
    config: MuxerConfig,
}

impl Muxer {
    /// Start muxing over `io`. `label` names the connection in logs and
    /// stream ids.
    pub fn new<T>(io: T, config: MuxerConfig, label: impl Into<String>) -> Muxer
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let shared = Arc::new(MuxerShared {
            label: label.clone(),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let (frame_tx, frame_rx) = mpsc::channel(config.outbound_queue);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue);
        let shutdown = CancellationToken::new();

        let codec = MplexCodec::new(config.max_frame_size);
        let (read_half, write_half) = tokio::io::split(io);

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, codec.clone()),
            frame_rx,
            shutdown.clone(),
            label.clone(),
        ));
        tokio::spawn(demux_loop(
            FramedRead::new(read_half, codec),
            shared.clone(),
            accept_tx,
            frame_tx.clone(),
            shutdown.clone(),
            config.clone(),
        ));

        Muxer {
            shared,
            frame_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown,
            config,
        }
    }

    /// Open a new outbound stream. An empty `name` gets the default
    /// `streamXXXXXXXX` name derived from the id.
    pub async fn open_stream(&self, name: Option<String>) -> Result<MuxedStream> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => format!("stream{id:08}"),
        };
        let key = StreamKey {
            initiator: true,
            id,
        };
        let stream = register_stream(&self.shared, &self.frame_tx, key, name.clone(), &self.config);
        if self.frame_tx.send(Frame::new_stream(id, &name)).await.is_err() {
            self.shared.streams.lock().remove(&key);
            return Err(Error::Closed);
        }
        tracing::debug!(muxer = %self.shared.label, id, name = %name, "opened stream");
        Ok(stream)
    }

    /// Receive the next remotely opened stream; `None` once the muxer is
    /// closed.
    pub async fn accept_stream(&self) -> Option<MuxedStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Number of live streams in the table
    pub fn num_streams(&self) -> usize {
        self.shared.streams.lock().len()
    }

    /// Has this muxer been shut down (locally or by connection loss)?
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Shut down: close the accept queue, reset all streams, drain the
    /// outbound queue and close the underlying connection.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(muxer = %self.shared.label, "closing muxer");
        self.shared.reset_all();
        self.shutdown.cancel();
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("label", &self.shared.label)
            .field("streams", &self.num_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Create the table entry and handle for a stream
fn register_stream(
    shared: &Arc<MuxerShared>,
    frame_tx: &mpsc::Sender<Frame>,
    key: StreamKey,
    name: String,
    config: &MuxerConfig,
) -> MuxedStream {
    let (data_tx, data_rx) = mpsc::channel(config.stream_queue);
    let state = Arc::new(StreamState::default());
    shared.streams.lock().insert(
        key,
        StreamEntry {
            data_tx: Some(data_tx),
            state: state.clone(),
        },
    );
    MuxedStream {
        key,
        name,
        id_label: format!("{}-{}", shared.label, key.id),
        protocol: None,
        state,
        shared: Arc::downgrade(shared),
        data_rx,
        read_buf: BytesMut::new(),
        read_eof: false,
        frame_tx: frame_tx.clone(),
        writer: PollSender::new(frame_tx.clone()),
        write_chunk: config.write_chunk,
        write_done: false,
    }
}

// ============================================================================
// TASKS
// ============================================================================

async fn write_loop<W>(
    mut framed: FramedWrite<W, MplexCodec>,
    mut frame_rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
    label: String,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                None => break,
                Some(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        tracing::debug!(muxer = %label, error = %e, "frame write failed");
                        return;
                    }
                }
            }
        }
    }
    // Drain frames already queued (Close/Reset emitted during shutdown),
    // then close the connection's write side.
    while let Ok(frame) = frame_rx.try_recv() {
        if framed.send(frame).await.is_err() {
            return;
        }
    }
    let _ = framed.flush().await;
    let _ = framed.close().await;
}

async fn demux_loop<R>(
    mut framed: FramedRead<R, MplexCodec>,
    shared: Arc<MuxerShared>,
    accept_tx: mpsc::Sender<MuxedStream>,
    frame_tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    config: MuxerConfig,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = framed.next() => match next {
                None => {
                    tracing::debug!(muxer = %shared.label, "connection closed by remote");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(muxer = %shared.label, error = %e, "inbound frame error");
                    break;
                }
                Some(Ok(frame)) => {
                    handle_inbound(&shared, &accept_tx, &frame_tx, &config, frame).await;
                }
            }
        }
    }
    shared.closed.store(true, Ordering::Release);
    shared.reset_all();
    shutdown.cancel();
}

async fn handle_inbound(
    shared: &Arc<MuxerShared>,
    accept_tx: &mpsc::Sender<MuxedStream>,
    frame_tx: &mpsc::Sender<Frame>,
    config: &MuxerConfig,
    frame: Frame,
) {
    let id = frame.stream_id;
    match frame.flag {
        FrameFlag::NewStream => {
            let key = StreamKey {
                initiator: false,
                id,
            };
            if shared.streams.lock().contains_key(&key) {
                tracing::warn!(muxer = %shared.label, id, "duplicate NewStream ignored");
                return;
            }
            let name = match std::str::from_utf8(&frame.payload) {
                Ok(name) if !name.is_empty() => name.to_string(),
                _ => format!("stream{id:08}"),
            };
            let stream = register_stream(shared, frame_tx, key, name, config);
            if accept_tx.send(stream).await.is_err() {
                // Nobody is accepting anymore; refuse the stream.
                shared.reset_stream(key);
                let _ = frame_tx.send(Frame::reset(false, id)).await;
            }
        }
        FrameFlag::MessageReceiver | FrameFlag::MessageInitiator => {
            // Flip the sender-relative role onto the local table.
            let key = StreamKey {
                initiator: frame.flag == FrameFlag::MessageReceiver,
                id,
            };
            let data_tx = {
                let streams = shared.streams.lock();
                match streams.get(&key) {
                    Some(entry) => entry.data_tx.clone(),
                    None => {
                        tracing::debug!(muxer = %shared.label, id, "message for unknown stream dropped");
                        return;
                    }
                }
            };
            let Some(data_tx) = data_tx else {
                tracing::debug!(muxer = %shared.label, id, "message after close dropped");
                return;
            };
            match tokio::time::timeout(config.slow_reader_timeout, data_tx.send(frame.payload))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // The reader handle is gone; nobody will ever drain
                    // this stream again.
                    shared.reset_stream(key);
                    let _ = frame_tx.send(Frame::reset(key.initiator, id)).await;
                }
                Err(_) => {
                    tracing::warn!(muxer = %shared.label, id, "slow reader, resetting stream");
                    shared.reset_stream(key);
                    let _ = frame_tx.send(Frame::reset(key.initiator, id)).await;
                }
            }
        }
        FrameFlag::CloseReceiver | FrameFlag::CloseInitiator => {
            let key = StreamKey {
                initiator: frame.flag == FrameFlag::CloseReceiver,
                id,
            };
            let mut streams = shared.streams.lock();
            if let Some(entry) = streams.get_mut(&key) {
                entry.data_tx = None;
                if entry.state.write_closed.load(Ordering::Acquire) {
                    streams.remove(&key);
                }
            }
        }
        FrameFlag::ResetReceiver | FrameFlag::ResetInitiator => {
            let key = StreamKey {
                initiator: frame.flag == FrameFlag::ResetReceiver,
                id,
            };
            shared.reset_stream(key);
        }
    }
}

// ============================================================================
// MUXED STREAM
// ============================================================================

/// One logical byte stream over a muxed connection.
///
/// Implements [`AsyncRead`]/[`AsyncWrite`]; a remote reset surfaces as
/// `io::ErrorKind::ConnectionReset` on both halves. Dropping a stream that
/// was neither fully closed nor reset sends a `Reset` to the peer.
pub struct MuxedStream {
    key: StreamKey,
    name: String,
    id_label: String,
    protocol: Option<String>,
    state: Arc<StreamState>,
    shared: Weak<MuxerShared>,
    data_rx: mpsc::Receiver<Bytes>,
    read_buf: BytesMut,
    read_eof: bool,
    frame_tx: mpsc::Sender<Frame>,
    writer: PollSender<Frame>,
    write_chunk: usize,
    write_done: bool,
}

impl MuxedStream {
    /// `<connection>-<stream>` identifier
    pub fn id(&self) -> &str {
        &self.id_label
    }

    /// Stream name from the `NewStream` frame
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the local side opened this stream
    pub fn is_initiator(&self) -> bool {
        self.key.initiator
    }

    /// Negotiated protocol, once known
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Record the negotiated protocol
    pub fn set_protocol(&mut self, protocol: impl Into<String>) {
        self.protocol = Some(protocol.into());
    }

    /// Has either side reset this stream?
    pub fn is_reset(&self) -> bool {
        self.state.reset.load(Ordering::Acquire)
    }

    /// Abort the stream: fail both halves and tell the peer.
    pub async fn reset(&mut self) -> Result<()> {
        if self.state.reset.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.write_closed.store(true, Ordering::Release);
        self.write_done = true;
        if let Some(shared) = self.shared.upgrade() {
            shared.streams.lock().remove(&self.key);
        }
        let _ = self
            .frame_tx
            .send(Frame::reset(self.key.initiator, self.key.id))
            .await;
        Ok(())
    }

    fn reset_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
    }
}

impl AsyncRead for MuxedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.state.reset.load(Ordering::Acquire) {
                return Poll::Ready(Err(MuxedStream::reset_error()));
            }
            if !this.read_buf.is_empty() {
                let n = buf.remaining().min(this.read_buf.len());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            match this.data_rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    this.read_buf.extend_from_slice(&bytes);
                }
                Poll::Ready(None) => {
                    if this.state.reset.load(Ordering::Acquire) {
                        return Poll::Ready(Err(MuxedStream::reset_error()));
                    }
                    // Remote half-close: drain done, clean EOF.
                    this.read_eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state.reset.load(Ordering::Acquire) {
            return Poll::Ready(Err(MuxedStream::reset_error()));
        }
        if this.write_done {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream output closed",
            )));
        }
        match this.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = data.len().min(this.write_chunk);
                let frame = Frame::message(
                    this.key.initiator,
                    this.key.id,
                    Bytes::copy_from_slice(&data[..n]),
                );
                match this.writer.send_item(frame) {
                    Ok(()) => Poll::Ready(Ok(n)),
                    Err(_) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "muxer closed",
                    ))),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "muxer closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the muxer's write task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_done || this.state.reset.load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }
        match this.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let frame = Frame::close(this.key.initiator, this.key.id);
                let sent = this.writer.send_item(frame).is_ok();
                this.write_done = true;
                this.state.write_closed.store(true, Ordering::Release);
                if let Some(shared) = this.shared.upgrade() {
                    shared.remove_if_finished(this.key);
                }
                if sent {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "muxer closed",
                    )))
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "muxer closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxedStream {
    fn drop(&mut self) {
        let abandoned = !self.write_done && !self.state.reset.load(Ordering::Acquire);
        if abandoned {
            self.state.reset.store(true, Ordering::Release);
            if let Some(shared) = self.shared.upgrade() {
                shared.streams.lock().remove(&self.key);
            }
            let _ = self
                .frame_tx
                .try_send(Frame::reset(self.key.initiator, self.key.id));
        }
    }
}

impl std::fmt::Debug for MuxedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxedStream")
            .field("id", &self.id_label)
            .field("name", &self.name)
            .field("initiator", &self.key.initiator)
            .field("protocol", &self.protocol)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
