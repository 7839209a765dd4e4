//! # Multistream Protocol Negotiation
//!
//! Line-oriented, in-band selection of an application protocol id over a
//! freshly opened stream.
//!
//! ## Wire format
//!
//! ```text
//! line     := varint(n) || bytes[n-1] || '\n'        (n counts the newline)
//! header   := "/multistream/1.0.0\n"
//! reject   := "na\n"
//! list     := "ls\n"
//! ```
//!
//! The dialer writes the header and then proposes candidate protocol ids
//! one at a time; `na` moves to the next candidate and an echo of the
//! proposal means success. The listener echoes the header, answers `na`
//! for unknown ids and echoes a match. Lines are capped at 1024 bytes;
//! anything longer, a bad header, or EOF before a match fails the
//! negotiation and the caller resets the stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Multistream-select protocol id and header line content
pub const PROTOCOL_ID: &str = "/multistream/1.0.0";

/// Reject response
const MSG_NA: &str = "na";
/// List request
const MSG_LS: &str = "ls";

/// Maximum encoded line length (varint value), newline included
const MAX_LINE: usize = 1024;

/// A registry the listener can negotiate against
pub trait ProtocolLookup {
    /// Does the table have a handler for `proto`?
    fn matches(&self, proto: &str) -> bool;
    /// All exactly-registered protocol ids, for `ls`
    fn protocols(&self) -> Vec<String>;
}

impl ProtocolLookup for [&str] {
    fn matches(&self, proto: &str) -> bool {
        self.contains(&proto)
    }

    fn protocols(&self) -> Vec<String> {
        self.iter().map(|p| p.to_string()).collect()
    }
}

// ============================================================================
// LINE FRAMING
// ============================================================================

/// Write one length-prefixed line
async fn write_line<T>(io: &mut T, line: &str) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let total = line.len() + 1;
    if total > MAX_LINE {
        return Err(Error::ProtocolViolation(format!(
            "negotiation line of {total} bytes exceeds {MAX_LINE}"
        )));
    }
    let mut buf = unsigned_varint::encode::u64_buffer();
    let prefix = unsigned_varint::encode::u64(total as u64, &mut buf);

    let mut frame = Vec::with_capacity(prefix.len() + total);
    frame.extend_from_slice(prefix);
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

/// Read one length-prefixed line, without the trailing newline
async fn read_line<T>(io: &mut T) -> Result<String>
where
    T: AsyncRead + Unpin,
{
    let len = read_varint(io).await? as usize;
    if len == 0 || len > MAX_LINE {
        return Err(Error::ProtocolViolation(format!(
            "negotiation line length {len} out of range"
        )));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await.map_err(eof_as_violation)?;
    if buf.pop() != Some(b'\n') {
        return Err(Error::ProtocolViolation(
            "negotiation line missing trailing newline".into(),
        ));
    }
    String::from_utf8(buf)
        .map_err(|_| Error::ProtocolViolation("negotiation line is not utf-8".into()))
}

/// Read an unsigned varint byte by byte.
///
/// Line lengths fit in two bytes; anything longer is malformed.
async fn read_varint<T>(io: &mut T) -> Result<u64>
where
    T: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    for shift in (0..).step_by(7).take(3) {
        let byte = io.read_u8().await.map_err(eof_as_violation)?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if byte == 0 && shift > 0 {
                return Err(Error::ProtocolViolation(
                    "non-minimal varint in negotiation".into(),
                ));
            }
            return Ok(value);
        }
    }
    Err(Error::ProtocolViolation(
        "negotiation varint too large".into(),
    ))
}

fn eof_as_violation(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ProtocolViolation("peer closed during negotiation".into())
    } else {
        Error::from_stream_io(err)
    }
}

// ============================================================================
// DIALER
// ============================================================================

/// Negotiate one of `protocols` as the stream's protocol, in order of
/// preference. Returns the selected id.
pub async fn dialer_select<T>(io: &mut T, protocols: &[String]) -> Result<String>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    write_line(io, PROTOCOL_ID).await?;
    let header = read_line(io).await?;
    if header != PROTOCOL_ID {
        return Err(Error::ProtocolViolation(format!(
            "unexpected negotiation header {header:?}"
        )));
    }

    for proto in protocols {
        write_line(io, proto).await?;
        loop {
            let response = read_line(io).await?;
            if response == *proto {
                tracing::debug!(protocol = %proto, "negotiated protocol");
                return Ok(proto.clone());
            }
            match response.as_str() {
                MSG_NA => break,
                // Listing responses are not requested by this dialer but a
                // stray one is skipped rather than failing the exchange.
                MSG_LS => continue,
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected negotiation response {other:?}"
                    )))
                }
            }
        }
    }
    Err(Error::NegotiationFailed)
}

// ============================================================================
// LISTENER
// ============================================================================

/// Serve the listener side of a negotiation against a handler table.
/// Returns the protocol id that was matched and echoed.
pub async fn listener_negotiate<T, L>(io: &mut T, table: &L) -> Result<String>
where
    T: AsyncRead + AsyncWrite + Unpin,
    L: ProtocolLookup + ?Sized,
{
    let header = read_line(io).await?;
    if header != PROTOCOL_ID {
        return Err(Error::ProtocolViolation(format!(
            "unexpected negotiation header {header:?}"
        )));
    }
    write_line(io, PROTOCOL_ID).await?;

    loop {
        let line = read_line(io).await?;
        match line.as_str() {
            MSG_LS => {
                for proto in table.protocols() {
                    write_line(io, &proto).await?;
                }
            }
            proto if table.matches(proto) => {
                write_line(io, proto).await?;
                tracing::debug!(protocol = %proto, "accepted protocol");
                return Ok(proto.to_string());
            }
            _ => write_line(io, MSG_NA).await?,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn protos(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_select_first_supported() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            listener_negotiate(&mut server, &["/a/1", "/b/1"] as &[&str]).await
        });
        let selected = dialer_select(&mut client, &protos(&["/x/1", "/b/1"]))
            .await
            .unwrap();

        assert_eq!(selected, "/b/1");
        assert_eq!(server_task.await.unwrap().unwrap(), "/b/1");
    }

    #[tokio::test]
    async fn test_wire_transcript() {
        // Drive only the client against a scripted server and check the raw
        // bytes both ways.
        let (mut client, mut wire) = tokio::io::duplex(4096);

        let script = tokio::spawn(async move {
            // Server side: header, then na for /x/1, then echo /b/1.
            assert_eq!(read_line(&mut wire).await.unwrap(), PROTOCOL_ID);
            write_line(&mut wire, PROTOCOL_ID).await.unwrap();
            assert_eq!(read_line(&mut wire).await.unwrap(), "/x/1");
            write_line(&mut wire, MSG_NA).await.unwrap();
            assert_eq!(read_line(&mut wire).await.unwrap(), "/b/1");
            write_line(&mut wire, "/b/1").await.unwrap();
        });

        let selected = dialer_select(&mut client, &protos(&["/x/1", "/b/1"]))
            .await
            .unwrap();
        assert_eq!(selected, "/b/1");
        script.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_common_protocol() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task =
            tokio::spawn(
                async move { listener_negotiate(&mut server, &["/a/1"] as &[&str]).await },
            );
        let result = dialer_select(&mut client, &protos(&["/x/1", "/y/1"])).await;
        assert!(matches!(result, Err(Error::NegotiationFailed)));

        drop(client);
        // The listener keeps waiting for more proposals until the dialer
        // goes away, then fails.
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bad_header_rejected() {
        let (mut client, mut wire) = tokio::io::duplex(4096);

        let script = tokio::spawn(async move {
            let _ = read_line(&mut wire).await;
            write_line(&mut wire, "/multistream/9.9.9").await.unwrap();
        });

        let result = dialer_select(&mut client, &protos(&["/a/1"])).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        script.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_line_rejected() {
        let (mut client, mut wire) = tokio::io::duplex(8192);

        // Claim a line longer than the cap.
        let mut buf = unsigned_varint::encode::u64_buffer();
        let prefix = unsigned_varint::encode::u64(2000, &mut buf);
        wire.write_all(prefix).await.unwrap();
        wire.write_all(&[b'x'; 64]).await.unwrap();

        let result = read_line(&mut client).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_missing_newline_rejected() {
        let (mut client, mut wire) = tokio::io::duplex(4096);

        let mut buf = unsigned_varint::encode::u64_buffer();
        let prefix = unsigned_varint::encode::u64(4, &mut buf);
        wire.write_all(prefix).await.unwrap();
        wire.write_all(b"abcd").await.unwrap(); // no trailing newline

        let result = read_line(&mut client).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_ls_lists_protocols() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            listener_negotiate(&mut server, &["/a/1", "/b/1"] as &[&str]).await
        });

        write_line(&mut client, PROTOCOL_ID).await.unwrap();
        assert_eq!(read_line(&mut client).await.unwrap(), PROTOCOL_ID);
        write_line(&mut client, MSG_LS).await.unwrap();
        assert_eq!(read_line(&mut client).await.unwrap(), "/a/1");
        assert_eq!(read_line(&mut client).await.unwrap(), "/b/1");
        write_line(&mut client, "/a/1").await.unwrap();
        assert_eq!(read_line(&mut client).await.unwrap(), "/a/1");

        assert_eq!(server_task.await.unwrap().unwrap(), "/a/1");
    }

    #[tokio::test]
    async fn test_eof_mid_negotiation() {
        let (mut client, wire) = tokio::io::duplex(4096);
        drop(wire);
        let result = dialer_select(&mut client, &protos(&["/a/1"])).await;
        assert!(result.is_err());
    }
}
