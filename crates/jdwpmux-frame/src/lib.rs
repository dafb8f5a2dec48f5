//! JDWP packet framing and DDMS chunk codec.
//!
//! Every JDWP packet starts with an 11-byte big-endian header:
//! - 4-byte total length (header included)
//! - 4-byte packet id
//! - 1-byte flags (`0x80` marks a reply)
//! - 2 bytes of either `cmdSet`/`cmd` (commands) or an error code (replies)
//!
//! Packets with the DDMS command set carry a sequence of chunks, each a
//! 4-byte ASCII tag plus a 4-byte length and payload.

pub mod chunk;
pub mod cmdset;
pub mod codec;
pub mod ddms;
pub mod error;
pub mod packet;
pub mod reader;
pub mod writer;

pub use chunk::{decode_chunks, encode_chunk, Chunk, ChunkType, CHUNK_HEADER_SIZE};
pub use codec::{
    decode_header, decode_packet, encode_packet, JdwpCodec, PacketConfig, PacketHeader,
    DEFAULT_MAX_PACKET_SIZE, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use packet::{Packet, PacketKind, Payload, PayloadSlot};
pub use reader::PacketReader;
pub use writer::PacketWriter;
