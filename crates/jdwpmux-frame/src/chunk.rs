use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cmdset;
use crate::error::{FrameError, Result};
use crate::packet::Packet;

/// Chunk header: type tag (4) + length (4).
pub const CHUNK_HEADER_SIZE: usize = 8;

/// DDMS chunk types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    /// Handshake: VM identity and process info.
    Helo,
    /// Supported VM features.
    Feat,
    /// Application name changed.
    Apnm,
    /// VM is waiting for a debugger.
    Wait,
    /// Failure reply to any chunk.
    Fail,
    /// Request the VM to exit.
    Exit,
    /// Heap garbage collection.
    Hpgc,
    /// Enable/disable allocation tracking.
    Reae,
    /// Query allocation tracking status.
    Reaq,
    /// Fetch recent allocations.
    Real,
    /// Query method profiling status.
    Mprq,
    /// Method profiling start (streaming).
    Mpss,
    /// Method profiling end (streaming).
    Mpse,
    /// Sampling profiling start.
    Spss,
    /// Sampling profiling end.
    Spse,
    Other([u8; 4]),
}

impl ChunkType {
    pub fn from_tag(tag: [u8; 4]) -> Self {
        match &tag {
            b"HELO" => Self::Helo,
            b"FEAT" => Self::Feat,
            b"APNM" => Self::Apnm,
            b"WAIT" => Self::Wait,
            b"FAIL" => Self::Fail,
            b"EXIT" => Self::Exit,
            b"HPGC" => Self::Hpgc,
            b"REAE" => Self::Reae,
            b"REAQ" => Self::Reaq,
            b"REAL" => Self::Real,
            b"MPRQ" => Self::Mprq,
            b"MPSS" => Self::Mpss,
            b"MPSE" => Self::Mpse,
            b"SPSS" => Self::Spss,
            b"SPSE" => Self::Spse,
            _ => Self::Other(tag),
        }
    }

    pub fn tag(&self) -> [u8; 4] {
        match self {
            Self::Helo => *b"HELO",
            Self::Feat => *b"FEAT",
            Self::Apnm => *b"APNM",
            Self::Wait => *b"WAIT",
            Self::Fail => *b"FAIL",
            Self::Exit => *b"EXIT",
            Self::Hpgc => *b"HPGC",
            Self::Reae => *b"REAE",
            Self::Reaq => *b"REAQ",
            Self::Real => *b"REAL",
            Self::Mprq => *b"MPRQ",
            Self::Mpss => *b"MPSS",
            Self::Mpse => *b"MPSE",
            Self::Spss => *b"SPSS",
            Self::Spse => *b"SPSE",
            Self::Other(tag) => *tag,
        }
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.tag() {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

/// One DDMS chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_type: ChunkType,
    pub payload: Bytes,
}

impl Chunk {
    pub fn new(chunk_type: ChunkType, payload: impl Into<Bytes>) -> Self {
        Self {
            chunk_type,
            payload: payload.into(),
        }
    }

    pub fn wire_size(&self) -> usize {
        CHUNK_HEADER_SIZE + self.payload.len()
    }

    /// Wrap this chunk in a DDMS command packet.
    pub fn into_command(self, id: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        encode_chunk(&self, &mut buf);
        Packet::command(id, cmdset::DDMS, cmdset::DDMS_CHUNK, buf.freeze())
    }

    /// Wrap this chunk in a reply packet.
    pub fn into_reply(self, id: u32) -> Packet {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        encode_chunk(&self, &mut buf);
        Packet::reply(id, buf.freeze())
    }
}

/// Encode one chunk.
pub fn encode_chunk(chunk: &Chunk, dst: &mut BytesMut) {
    dst.reserve(chunk.wire_size());
    dst.put_slice(&chunk.chunk_type.tag());
    dst.put_u32(chunk.payload.len() as u32);
    dst.put_slice(&chunk.payload);
}

/// Decode every chunk in a DDMS packet payload.
///
/// The payload must be made of whole chunks; a declared length running past
/// the end is a framing error. A trailing fragment shorter than a chunk
/// header is ignored.
pub fn decode_chunks(payload: &Bytes) -> Result<Vec<Chunk>> {
    let mut src = payload.clone();
    let mut chunks = Vec::new();
    while src.remaining() >= CHUNK_HEADER_SIZE {
        let mut tag = [0u8; 4];
        src.copy_to_slice(&mut tag);
        let declared = src.get_u32() as usize;
        if declared > src.remaining() {
            return Err(FrameError::LengthMismatch {
                declared,
                available: src.remaining(),
            });
        }
        chunks.push(Chunk {
            chunk_type: ChunkType::from_tag(tag),
            payload: src.split_to(declared),
        });
    }
    if src.has_remaining() {
        tracing::trace!(bytes = src.remaining(), "ignoring trailing bytes after last chunk");
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_map_both_ways() {
        for tag in [
            *b"HELO", *b"FEAT", *b"APNM", *b"WAIT", *b"FAIL", *b"EXIT", *b"HPGC", *b"REAE",
            *b"REAQ", *b"REAL", *b"MPRQ", *b"MPSS", *b"MPSE", *b"SPSS", *b"SPSE", *b"ZZZZ",
        ] {
            assert_eq!(ChunkType::from_tag(tag).tag(), tag);
        }
        assert_eq!(ChunkType::from_tag(*b"ZZZZ"), ChunkType::Other(*b"ZZZZ"));
        assert_eq!(ChunkType::Helo.to_string(), "HELO");
        assert_eq!(ChunkType::Other([0, b'A', b'B', b'C']).to_string(), "\\x00ABC");
    }

    #[test]
    fn encode_layout() {
        let mut buf = BytesMut::new();
        encode_chunk(&Chunk::new(ChunkType::Exit, vec![0, 0, 0, 3]), &mut buf);
        assert_eq!(buf.as_ref(), b"EXIT\x00\x00\x00\x04\x00\x00\x00\x03");
    }

    #[test]
    fn decode_multiple_chunks() {
        let mut buf = BytesMut::new();
        encode_chunk(&Chunk::new(ChunkType::Apnm, vec![1, 2]), &mut buf);
        encode_chunk(&Chunk::new(ChunkType::Wait, vec![0]), &mut buf);
        let chunks = decode_chunks(&buf.freeze()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_type, ChunkType::Apnm);
        assert_eq!(chunks[0].payload.as_ref(), &[1, 2]);
        assert_eq!(chunks[1].chunk_type, ChunkType::Wait);
    }

    #[test]
    fn decode_rejects_overlong_chunk() {
        let payload = Bytes::from_static(b"HELO\x00\x00\x00\x10abc");
        let err = decode_chunks(&payload).unwrap_err();
        assert!(matches!(
            err,
            FrameError::LengthMismatch {
                declared: 16,
                available: 3
            }
        ));
    }

    #[test]
    fn empty_payload_has_no_chunks() {
        assert!(decode_chunks(&Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn into_command_wraps_in_ddms_packet() {
        let packet = Chunk::new(ChunkType::Hpgc, Bytes::new()).into_command(5);
        assert!(packet.is_ddms_command());
        assert_eq!(packet.id, 5);
        let chunks = packet.ddms_chunks().unwrap();
        assert_eq!(chunks, vec![Chunk::new(ChunkType::Hpgc, Bytes::new())]);

        let reply = Chunk::new(ChunkType::Hpgc, Bytes::new()).into_reply(5);
        assert!(reply.is_reply());
        assert_eq!(reply.ddms_chunks().unwrap().len(), 1);
    }
}
