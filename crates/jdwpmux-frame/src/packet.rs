use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::chunk::{decode_chunks, Chunk};
use crate::cmdset::{self, REPLY_FLAG};
use crate::codec::HEADER_SIZE;
use crate::error::{FrameError, Result};

/// The category of a packet, decoded from the flag byte and the last two
/// header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Command { cmd_set: u8, cmd: u8 },
    /// A reply with error code 0.
    Reply,
    /// A reply with a non-zero error code.
    Error { error_code: u16 },
}

impl PacketKind {
    /// Reassemble from the header fields.
    pub fn from_header(flags: u8, b9: u8, b10: u8) -> Self {
        if flags & REPLY_FLAG != 0 {
            match u16::from_be_bytes([b9, b10]) {
                0 => Self::Reply,
                error_code => Self::Error { error_code },
            }
        } else {
            Self::Command { cmd_set: b9, cmd: b10 }
        }
    }

    /// The two trailing header bytes.
    pub fn header_bytes(&self) -> [u8; 2] {
        match *self {
            Self::Command { cmd_set, cmd } => [cmd_set, cmd],
            Self::Reply => [0, 0],
            Self::Error { error_code } => error_code.to_be_bytes(),
        }
    }

    pub fn is_reply(&self) -> bool {
        !matches!(self, Self::Command { .. })
    }
}

/// Tracks which read currently owns the shared read buffer of a stream.
///
/// Each packet read from a [`crate::PacketReader`] is bound to the slot
/// generation at the time of the read; the next read advances the
/// generation and earlier unread payloads become unavailable.
#[derive(Debug, Clone, Default)]
pub struct PayloadSlot {
    generation: Arc<AtomicU64>,
}

impl PayloadSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate every payload bound so far and return the new generation.
    pub fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Packet payload bytes, either owned or bound to a [`PayloadSlot`].
#[derive(Debug, Clone)]
pub struct Payload {
    bytes: Bytes,
    binding: Option<(PayloadSlot, u64)>,
}

impl Payload {
    pub fn owned(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            binding: None,
        }
    }

    pub fn empty() -> Self {
        Self::owned(Bytes::new())
    }

    pub(crate) fn bind(&mut self, slot: &PayloadSlot) {
        self.binding = Some((slot.clone(), slot.advance()));
    }

    /// Declared size, available even after the bytes expire.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_available(&self) -> bool {
        match &self.binding {
            Some((slot, generation)) => slot.current() == *generation,
            None => true,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.binding.is_none()
    }
}

/// One JDWP packet.
///
/// Packets read from a stream carry a lazy payload; use [`Packet::detach`]
/// to keep one beyond the next read. Packets built for sending own their
/// payload. The reply bit of the flags always agrees with the kind.
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u32,
    flags: u8,
    kind: PacketKind,
    payload: Payload,
}

impl Packet {
    /// The reply bit of `flags` is overridden by `kind`; other bits are kept.
    pub fn new(id: u32, flags: u8, kind: PacketKind, payload: Payload) -> Self {
        let flags = if kind.is_reply() {
            flags | REPLY_FLAG
        } else {
            flags & !REPLY_FLAG
        };
        Self {
            id,
            flags,
            kind,
            payload,
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Build a command packet.
    pub fn command(id: u32, cmd_set: u8, cmd: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(
            id,
            0,
            PacketKind::Command { cmd_set, cmd },
            Payload::owned(payload),
        )
    }

    /// Build a successful reply packet.
    pub fn reply(id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(id, REPLY_FLAG, PacketKind::Reply, Payload::owned(payload))
    }

    /// Build an error reply packet with no payload.
    pub fn error_reply(id: u32, error_code: u16) -> Self {
        let kind = if error_code == 0 {
            PacketKind::Reply
        } else {
            PacketKind::Error { error_code }
        };
        Self::new(id, REPLY_FLAG, kind, Payload::empty())
    }

    /// Total wire length (header + payload).
    pub fn length(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn is_command(&self) -> bool {
        !self.is_reply()
    }

    pub fn is_reply(&self) -> bool {
        self.kind.is_reply()
    }

    pub fn cmd_set(&self) -> Option<u8> {
        match self.kind {
            PacketKind::Command { cmd_set, .. } => Some(cmd_set),
            _ => None,
        }
    }

    pub fn cmd(&self) -> Option<u8> {
        match self.kind {
            PacketKind::Command { cmd, .. } => Some(cmd),
            _ => None,
        }
    }

    /// Error code of a reply; 0 for successful replies and for commands.
    pub fn error_code(&self) -> u16 {
        match self.kind {
            PacketKind::Error { error_code } => error_code,
            _ => 0,
        }
    }

    /// True for commands carrying DDMS chunks.
    pub fn is_ddms_command(&self) -> bool {
        matches!(self.kind, PacketKind::Command { cmd_set, cmd } if cmdset::is_ddms(cmd_set, cmd))
    }

    /// The payload bytes, if they have not been invalidated by a later read.
    pub fn payload(&self) -> Result<Bytes> {
        if self.payload.is_available() {
            Ok(self.payload.bytes.clone())
        } else {
            Err(FrameError::PayloadUnavailable { id: self.id })
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_payload_available(&self) -> bool {
        self.payload.is_available()
    }

    /// Replace the payload with owned bytes.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = Payload::owned(payload);
    }

    /// Copy into a packet with an owned payload that never expires.
    pub fn detach(&self) -> Result<Packet> {
        let bytes = Bytes::copy_from_slice(&self.payload()?);
        Ok(Self::new(self.id, self.flags, self.kind, Payload::owned(bytes)))
    }

    /// Decode the DDMS chunks of this packet.
    pub fn ddms_chunks(&self) -> Result<Vec<Chunk>> {
        if !self.is_ddms_command() && !self.is_reply() {
            return Err(FrameError::NotDdms { id: self.id });
        }
        decode_chunks(&self.payload()?)
    }

    pub(crate) fn bind_payload(&mut self, slot: &PayloadSlot) {
        self.payload.bind(slot);
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            PacketKind::Command { cmd_set, cmd } => write!(
                f,
                "command id={} {}({cmd_set}).{cmd} length={}",
                self.id,
                cmdset::command_set_name(cmd_set),
                self.length()
            ),
            PacketKind::Reply => write!(f, "reply id={} length={}", self.id, self.length()),
            PacketKind::Error { error_code } => write!(
                f,
                "reply id={} error={error_code} length={}",
                self.id,
                self.length()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_header() {
        assert_eq!(
            PacketKind::from_header(0, 1, 10),
            PacketKind::Command { cmd_set: 1, cmd: 10 }
        );
        assert_eq!(PacketKind::from_header(0x80, 0, 0), PacketKind::Reply);
        assert_eq!(
            PacketKind::from_header(0x80, 0, 41),
            PacketKind::Error { error_code: 41 }
        );
        assert_eq!(PacketKind::Error { error_code: 0x1234 }.header_bytes(), [0x12, 0x34]);
    }

    #[test]
    fn command_and_reply_accessors() {
        let cmd = Packet::command(7, cmdset::VM, cmdset::VM_EXIT, vec![0, 0, 0, 1]);
        assert!(cmd.is_command());
        assert_eq!(cmd.cmd_set(), Some(1));
        assert_eq!(cmd.cmd(), Some(10));
        assert_eq!(cmd.length(), HEADER_SIZE + 4);
        assert_eq!(cmd.error_code(), 0);

        let err = Packet::error_reply(7, 100);
        assert!(err.is_reply());
        assert_eq!(err.cmd_set(), None);
        assert_eq!(err.error_code(), 100);
        assert_eq!(Packet::error_reply(7, 0).kind(), PacketKind::Reply);
    }

    #[test]
    fn reply_bit_follows_kind() {
        let reply = Packet::new(4, 0, PacketKind::Reply, Payload::empty());
        assert!(reply.is_reply());
        assert_eq!(reply.flags() & REPLY_FLAG, REPLY_FLAG);

        let command = Packet::new(
            5,
            REPLY_FLAG | 0x01,
            PacketKind::Command { cmd_set: 1, cmd: 1 },
            Payload::empty(),
        );
        assert!(command.is_command());
        assert_eq!(command.flags(), 0x01);
        assert_eq!(command.cmd_set(), Some(1));
    }

    #[test]
    fn bound_payload_expires_on_advance() {
        let slot = PayloadSlot::new();
        let mut first = Packet::reply(1, &b"abc"[..]);
        first.bind_payload(&slot);
        assert_eq!(first.payload().unwrap().as_ref(), b"abc");

        let kept = first.detach().unwrap();
        let shallow = first.clone();

        let mut second = Packet::reply(2, &b"def"[..]);
        second.bind_payload(&slot);

        assert!(matches!(
            first.payload(),
            Err(FrameError::PayloadUnavailable { id: 1 })
        ));
        assert!(shallow.payload().is_err());
        assert_eq!(first.payload_len(), 3);
        assert_eq!(kept.payload().unwrap().as_ref(), b"abc");
        assert!(kept.payload.is_owned());
        assert_eq!(second.payload().unwrap().as_ref(), b"def");
        assert!(first.detach().is_err());
    }

    #[test]
    fn ddms_command_detection() {
        let ddms = Packet::command(1, cmdset::DDMS, cmdset::DDMS_CHUNK, Bytes::new());
        assert!(ddms.is_ddms_command());
        let plain = Packet::command(1, cmdset::VM, cmdset::VM_VERSION, Bytes::new());
        assert!(!plain.is_ddms_command());
        assert!(matches!(
            plain.ddms_chunks(),
            Err(FrameError::NotDdms { id: 1 })
        ));
    }

    #[test]
    fn display_names_command_set() {
        let cmd = Packet::command(3, cmdset::VM, cmdset::VM_VERSION, Bytes::new());
        assert_eq!(cmd.to_string(), "command id=3 VirtualMachine(1).1 length=11");
    }
}
