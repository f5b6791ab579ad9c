//! Length-prefixed framing.
//!
//! ```text
//! +----------------+--------+---------+---------------------+
//! | length: u32 BE | type   | subtype | payload             |
//! | = 2 + payload  | u8     | u8      | length - 2 bytes    |
//! +----------------+--------+---------+---------------------+
//! ```
//!
//! No magic, version or checksum. A length below 2 (or above the configured
//! maximum) means the stream is desynchronised for good; callers drop the
//! connection instead of trying to resync.

use crate::error::ProtocolError;
use crate::protocol::{Packet, PacketKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 4;
pub const MIN_BODY_LEN: u32 = 2;

/// Validate a decoded length field.
pub fn check_body_len(len: u32, max_frame_len: u32) -> Result<usize, ProtocolError> {
    if len < MIN_BODY_LEN {
        return Err(ProtocolError::FrameTooShort(len));
    }
    if len > max_frame_len {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(len as usize)
}

/// Serialise one packet into a complete frame.
pub fn encode(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let body_len =
        u32::try_from(packet.body_len()).map_err(|_| ProtocolError::FrameTooLarge(u32::MAX))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len as usize);
    buf.put_u32(body_len);
    buf.put_u8(packet.kind.ptype);
    buf.put_u8(packet.kind.subtype);
    buf.put_slice(&packet.payload);
    Ok(buf.freeze())
}

/// Pop one frame off the front of `buf`. `Ok(None)` means more bytes are
/// needed; `buf` is left untouched in that case.
pub fn try_decode(buf: &mut BytesMut, max_frame_len: u32) -> Result<Option<Packet>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len_field = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let body_len = check_body_len(len_field, max_frame_len)?;
    if buf.len() < HEADER_LEN + body_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let mut body = buf.split_to(body_len);
    let ptype = body.get_u8();
    let subtype = body.get_u8();
    Ok(Some(Packet::new(PacketKind::new(ptype, subtype), body.freeze())))
}

/// Decode a buffer holding exactly one complete frame.
pub fn decode_frame(frame: &[u8], max_frame_len: u32) -> Result<Packet, ProtocolError> {
    let mut buf = BytesMut::from(frame);
    match try_decode(&mut buf, max_frame_len)? {
        Some(packet) => Ok(packet),
        None => {
            let expected = if frame.len() < HEADER_LEN {
                HEADER_LEN
            } else {
                HEADER_LEN + u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize
            };
            Err(ProtocolError::Truncated {
                expected,
                actual: frame.len(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Async stream I/O
// ---------------------------------------------------------------------------

#[cfg(feature = "net")]
pub use stream::{read_packet, write_packet};

#[cfg(feature = "net")]
mod stream {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Read exactly one frame. `Ok(None)` on a clean end of stream before
    /// any header byte.
    pub async fn read_packet<R>(reader: &mut R, max_frame_len: u32) -> Result<Option<Packet>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated {
                    expected: HEADER_LEN,
                    actual: filled,
                });
            }
            filled += n;
        }

        let body_len = check_body_len(u32::from_be_bytes(header), max_frame_len)?;
        let mut body = BytesMut::zeroed(body_len);
        reader.read_exact(&mut body).await?;

        let ptype = body.get_u8();
        let subtype = body.get_u8();
        Ok(Some(Packet::new(PacketKind::new(ptype, subtype), body.freeze())))
    }

    /// Write one frame (length, type, subtype, payload) and flush.
    pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = encode(packet)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}
