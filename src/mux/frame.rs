//! Muxer frame codec.
//!
//! Every frame is `varint(header) || varint(len) || bytes[len]` with
//! `header = (stream_id << 3) | tag`. Varints are minimally encoded and at
//! most 9 bytes (63 bits). `Close*` and `Reset*` frames must carry an empty
//! payload. The tag names the sender's role, so the receiver flips it when
//! mapping a frame onto its local stream table.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Default cap on a frame payload (1 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Longest accepted varint: 9 bytes of 7 payload bits each (63 bits)
const MAX_VARINT_BYTES: usize = 9;

/// Frame tag, from the sender's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFlag {
    /// Open a new stream; payload is the stream name
    NewStream = 0,
    /// Data on a stream the sender accepted
    MessageReceiver = 1,
    /// Data on a stream the sender opened
    MessageInitiator = 2,
    /// Half-close of a stream the sender accepted
    CloseReceiver = 3,
    /// Half-close of a stream the sender opened
    CloseInitiator = 4,
    /// Abort of a stream the sender accepted
    ResetReceiver = 5,
    /// Abort of a stream the sender opened
    ResetInitiator = 6,
}

impl FrameFlag {
    fn from_tag(tag: u64) -> Result<FrameFlag> {
        match tag {
            0 => Ok(FrameFlag::NewStream),
            1 => Ok(FrameFlag::MessageReceiver),
            2 => Ok(FrameFlag::MessageInitiator),
            3 => Ok(FrameFlag::CloseReceiver),
            4 => Ok(FrameFlag::CloseInitiator),
            5 => Ok(FrameFlag::ResetReceiver),
            6 => Ok(FrameFlag::ResetInitiator),
            other => Err(Error::ProtocolViolation(format!("unknown frame tag {other}"))),
        }
    }

    /// Must this flag carry an empty payload?
    pub fn requires_empty_payload(&self) -> bool {
        matches!(
            self,
            FrameFlag::CloseReceiver
                | FrameFlag::CloseInitiator
                | FrameFlag::ResetReceiver
                | FrameFlag::ResetInitiator
        )
    }
}

/// One muxer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream id in the opener's numbering
    pub stream_id: u64,
    /// Frame tag, sender's perspective
    pub flag: FrameFlag,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Open stream `id` named `name`
    pub fn new_stream(id: u64, name: &str) -> Frame {
        Frame {
            stream_id: id,
            flag: FrameFlag::NewStream,
            payload: Bytes::copy_from_slice(name.as_bytes()),
        }
    }

    /// Data frame, `initiator` telling whether the local side opened the
    /// stream
    pub fn message(initiator: bool, id: u64, payload: Bytes) -> Frame {
        Frame {
            stream_id: id,
            flag: if initiator {
                FrameFlag::MessageInitiator
            } else {
                FrameFlag::MessageReceiver
            },
            payload,
        }
    }

    /// Half-close frame
    pub fn close(initiator: bool, id: u64) -> Frame {
        Frame {
            stream_id: id,
            flag: if initiator {
                FrameFlag::CloseInitiator
            } else {
                FrameFlag::CloseReceiver
            },
            payload: Bytes::new(),
        }
    }

    /// Abort frame
    pub fn reset(initiator: bool, id: u64) -> Frame {
        Frame {
            stream_id: id,
            flag: if initiator {
                FrameFlag::ResetInitiator
            } else {
                FrameFlag::ResetReceiver
            },
            payload: Bytes::new(),
        }
    }
}

// ============================================================================
// CODEC
// ============================================================================

/// Frame encoder/decoder with a configurable payload cap
#[derive(Debug, Clone)]
pub struct MplexCodec {
    max_payload: usize,
}

impl MplexCodec {
    /// Codec with the given payload cap
    pub fn new(max_payload: usize) -> MplexCodec {
        MplexCodec { max_payload }
    }
}

impl Default for MplexCodec {
    fn default() -> Self {
        MplexCodec::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Decode one varint from the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; errors are protocol violations
/// (non-minimal encoding or more than 63 bits).
fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (index, &byte) in buf.iter().enumerate() {
        if index >= MAX_VARINT_BYTES {
            return Err(Error::ProtocolViolation("varint exceeds 63 bits".into()));
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            if byte == 0 && index > 0 {
                return Err(Error::ProtocolViolation("non-minimal varint".into()));
            }
            return Ok(Some((value, index + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_BYTES {
        return Err(Error::ProtocolViolation("varint exceeds 63 bits".into()));
    }
    Ok(None)
}

fn encode_varint(value: u64, dst: &mut BytesMut) {
    let mut buf = unsigned_varint::encode::u64_buffer();
    dst.put_slice(unsigned_varint::encode::u64(value, &mut buf));
}

impl Decoder for MplexCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((header, header_len)) = decode_varint(src)? else {
            return Ok(None);
        };
        let Some((payload_len, len_len)) = decode_varint(&src[header_len..])? else {
            return Ok(None);
        };

        let payload_len = payload_len as usize;
        if payload_len > self.max_payload {
            return Err(Error::ProtocolViolation(format!(
                "frame payload of {payload_len} bytes exceeds {}",
                self.max_payload
            )));
        }

        let flag = FrameFlag::from_tag(header & 0x07)?;
        if flag.requires_empty_payload() && payload_len != 0 {
            return Err(Error::ProtocolViolation(format!(
                "{flag:?} frame must carry an empty payload"
            )));
        }

        let frame_len = header_len + len_len + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(header_len + len_len);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Frame {
            stream_id: header >> 3,
            flag,
            payload,
        }))
    }
}

impl Encoder<Frame> for MplexCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.flag.requires_empty_payload() && !frame.payload.is_empty() {
            return Err(Error::ProtocolViolation(format!(
                "{:?} frame must carry an empty payload",
                frame.flag
            )));
        }
        if frame.payload.len() > self.max_payload {
            return Err(Error::ProtocolViolation(format!(
                "frame payload of {} bytes exceeds {}",
                frame.payload.len(),
                self.max_payload
            )));
        }
        let header = (frame.stream_id << 3) | frame.flag as u64;
        dst.reserve(frame.payload.len() + 2 * MAX_VARINT_BYTES);
        encode_varint(header, dst);
        encode_varint(frame.payload.len() as u64, dst);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = MplexCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decoder must consume the whole frame");
        decoded
    }

    #[test]
    fn test_roundtrip_all_flags() {
        for frame in [
            Frame::new_stream(0, "stream00000000"),
            Frame::message(true, 7, Bytes::from_static(b"hello")),
            Frame::message(false, 7, Bytes::from_static(b"world")),
            Frame::close(true, 3),
            Frame::close(false, 3),
            Frame::reset(true, 1 << 40),
            Frame::reset(false, 9),
        ] {
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_incremental_decode() {
        let mut codec = MplexCodec::default();
        let mut full = BytesMut::new();
        codec
            .encode(Frame::message(true, 300, Bytes::from(vec![0xab; 200])), &mut full)
            .unwrap();

        let mut partial = BytesMut::new();
        for chunk in full.chunks(7) {
            partial.extend_from_slice(chunk);
            if partial.len() < full.len() {
                assert!(codec.decode(&mut partial).unwrap().is_none());
            }
        }
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.stream_id, 300);
        assert_eq!(frame.payload.len(), 200);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut codec = MplexCodec::default();
        // header = (1 << 3) | 7 — tag 7 does not exist
        let mut buf = BytesMut::from(&[0x0f, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_nonempty_close_rejected() {
        let mut codec = MplexCodec::default();
        // header = (0 << 3) | 4 (CloseInitiator), len = 1, one payload byte
        let mut buf = BytesMut::from(&[0x04, 0x01, 0xaa][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));

        let bad = Frame {
            stream_id: 0,
            flag: FrameFlag::ResetInitiator,
            payload: Bytes::from_static(b"x"),
        };
        let mut dst = BytesMut::new();
        assert!(codec.encode(bad, &mut dst).is_err());
    }

    #[test]
    fn test_non_minimal_varint_rejected() {
        let mut codec = MplexCodec::default();
        // 0x80 0x00 encodes zero in two bytes
        let mut buf = BytesMut::from(&[0x80, 0x00, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_varint_over_63_bits_rejected() {
        let mut codec = MplexCodec::default();
        // Ten continuation bytes never fit the 9-byte cap
        let mut buf = BytesMut::from(&[0xff; 10][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut codec = MplexCodec::new(16);
        let mut buf = BytesMut::new();
        // header = (1 << 3) | 2, claimed len = 17
        buf.put_slice(&[0x0a, 0x11]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));

        let frame = Frame::message(true, 1, Bytes::from(vec![0u8; 17]));
        let mut dst = BytesMut::new();
        assert!(codec.encode(frame, &mut dst).is_err());
    }

    #[test]
    fn test_empty_buffer_needs_more() {
        let mut codec = MplexCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
