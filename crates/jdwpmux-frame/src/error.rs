use std::time::Duration;

/// Errors that can occur during packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header declares a length smaller than the header itself.
    #[error("invalid packet length {length} (header is {min} bytes)")]
    InvalidLength { length: u32, min: usize },

    /// The packet exceeds the configured maximum size.
    #[error("packet too large ({size} bytes, max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// A chunk declares more bytes than its packet carries.
    #[error("chunk length mismatch (declared {declared} bytes, {available} available)")]
    LengthMismatch { declared: usize, available: usize },

    /// The stream ended in the middle of a packet.
    #[error("stream truncated ({received} of {expected} bytes)")]
    Truncated { expected: usize, received: usize },

    /// A DDMS chunk payload could not be parsed.
    #[error("malformed {chunk} chunk: {reason}")]
    MalformedChunk { chunk: String, reason: String },

    /// The packet is not a DDMS chunk packet.
    #[error("packet {id} does not carry DDMS chunks")]
    NotDdms { id: u32 },

    /// The payload of a received packet was invalidated by a later read.
    #[error("payload of packet {id} is no longer available")]
    PayloadUnavailable { id: u32 },

    /// A read or write did not complete in time.
    #[error("packet I/O timed out after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred while reading or writing packets.
    #[error("packet I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An earlier write stopped partway through a frame.
    #[error("stream is mid-packet after an earlier failed write")]
    Poisoned,

    /// The connection was closed on a packet boundary.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    pub(crate) fn malformed(chunk: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::MalformedChunk {
            chunk: chunk.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the connection can no longer be framed after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::MalformedChunk { .. }
                | Self::NotDdms { .. }
                | Self::PayloadUnavailable { .. }
                | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
