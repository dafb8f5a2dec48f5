use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};
use crate::packet::{Packet, PacketKind, Payload};

/// Packet header: length (4) + id (4) + flags (1) + cmdSet/cmd or error code (2).
pub const HEADER_SIZE: usize = 11;

/// Default maximum packet size: 64 MiB.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub id: u32,
    pub flags: u8,
    pub kind: PacketKind,
}

impl PacketHeader {
    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }
}

/// Encode a packet into the wire format.
///
/// Wire format (big-endian):
/// ```text
/// ┌────────────┬────────────┬────────┬──────────────────────┬───────────┐
/// │ Length (4) │ Id (4)     │ Flags  │ CmdSet+Cmd (1+1) or  │ Payload   │
/// │ incl. hdr  │            │ (1)    │ ErrorCode (2)        │           │
/// └────────────┴────────────┴────────┴──────────────────────┴───────────┘
/// ```
pub fn encode_packet(packet: &Packet, dst: &mut BytesMut) -> Result<()> {
    let payload = packet.payload()?;
    let length = HEADER_SIZE + payload.len();
    if length > u32::MAX as usize {
        return Err(FrameError::PacketTooLarge {
            size: length,
            max: u32::MAX as usize,
        });
    }
    dst.reserve(length);
    dst.put_u32(length as u32);
    dst.put_u32(packet.id);
    dst.put_u8(packet.flags());
    dst.put_slice(&packet.kind().header_bytes());
    dst.put_slice(&payload);
    Ok(())
}

/// Decode and validate a header without consuming it.
///
/// Returns `Ok(None)` if fewer than [`HEADER_SIZE`] bytes are buffered.
pub fn decode_header(src: &[u8], max_packet: usize) -> Result<Option<PacketHeader>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    if (length as usize) < HEADER_SIZE {
        return Err(FrameError::InvalidLength {
            length,
            min: HEADER_SIZE,
        });
    }
    if length as usize > max_packet {
        return Err(FrameError::PacketTooLarge {
            size: length as usize,
            max: max_packet,
        });
    }
    let id = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
    let flags = src[8];
    Ok(Some(PacketHeader {
        length,
        id,
        flags,
        kind: PacketKind::from_header(flags, src[9], src[10]),
    }))
}

/// Decode a packet from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete packet yet.
/// On success, consumes the packet bytes from the buffer. The payload is
/// owned; readers bind it to their slot afterwards.
pub fn decode_packet(src: &mut BytesMut, max_packet: usize) -> Result<Option<Packet>> {
    let Some(header) = decode_header(src, max_packet)? else {
        return Ok(None);
    };
    let total = header.length as usize;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    src.advance(HEADER_SIZE);
    let payload = src.split_to(header.payload_len()).freeze();
    Ok(Some(Packet::new(
        header.id,
        header.flags,
        header.kind,
        Payload::owned(payload),
    )))
}

/// Configuration for packet streams.
#[derive(Debug, Clone)]
pub struct PacketConfig {
    /// Maximum packet size in bytes, header included. Default: 64 MiB.
    pub max_packet_size: usize,
    /// Bound on waiting for one complete packet.
    pub read_timeout: Option<Duration>,
    /// Bound on writing one packet.
    pub write_timeout: Option<Duration>,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// `tokio_util` codec for use with `Framed`/`FramedRead`/`FramedWrite`.
#[derive(Debug, Clone)]
pub struct JdwpCodec {
    max_packet_size: usize,
}

impl JdwpCodec {
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for JdwpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JdwpCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        decode_packet(src, self.max_packet_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(truncated(src, self.max_packet_size)),
        }
    }
}

impl Encoder<Packet> for JdwpCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        encode_packet(&item, dst)
    }
}

impl Encoder<&Packet> for JdwpCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<()> {
        encode_packet(item, dst)
    }
}

/// The error for a stream that ended with `src` holding a partial packet.
pub(crate) fn truncated(src: &BytesMut, max_packet: usize) -> FrameError {
    let expected = match decode_header(src, max_packet) {
        Ok(Some(header)) => header.length as usize,
        _ => HEADER_SIZE,
    };
    FrameError::Truncated {
        expected,
        received: src.len(),
    }
}
