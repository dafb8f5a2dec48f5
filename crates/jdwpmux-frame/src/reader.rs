use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::{decode_packet, truncated, PacketConfig};
use crate::error::{FrameError, Result};
use crate::packet::{Packet, PayloadSlot};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads complete packets from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get complete packets.
/// Each returned packet's payload stays readable until the next successful
/// [`PacketReader::read_packet`].
pub struct PacketReader<R> {
    inner: R,
    buf: BytesMut,
    config: PacketConfig,
    slot: PayloadSlot,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Create a new packet reader with default configuration.
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, PacketConfig::default())
    }

    /// Create a new packet reader with explicit configuration.
    pub fn with_config(inner: R, config: PacketConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            slot: PayloadSlot::new(),
        }
    }

    /// Read the next complete packet.
    ///
    /// Cancel-safe: bytes read before cancellation stay buffered for the
    /// next call. Returns `Err(FrameError::ConnectionClosed)` on EOF at a
    /// packet boundary and `Err(FrameError::Truncated)` on EOF mid-packet.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        match self.config.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.read_packet_inner())
                .await
                .map_err(|_| FrameError::Timeout(timeout))?,
            None => self.read_packet_inner().await,
        }
    }

    async fn read_packet_inner(&mut self) -> Result<Packet> {
        loop {
            if let Some(mut packet) = decode_packet(&mut self.buf, self.config.max_packet_size)? {
                packet.bind_payload(&self.slot);
                return Ok(packet);
            }

            self.buf.reserve(INITIAL_BUFFER_CAPACITY);
            let read = match self.inner.read_buf(&mut self.buf).await {
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                if self.buf.is_empty() {
                    return Err(FrameError::ConnectionClosed);
                }
                return Err(truncated(&self.buf, self.config.max_packet_size));
            }
        }
    }

    /// Bytes received but not yet returned as a packet.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Current packet reader configuration.
    pub fn config(&self) -> &PacketConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::codec::encode_packet;

    fn wire(packets: &[Packet]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for p in packets {
            encode_packet(p, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn read_single_packet() {
        let data = wire(&[Packet::reply(1, &b"hello"[..])]);
        let mut reader = PacketReader::new(&data[..]);
        let packet = reader.read_packet().await.unwrap();
        assert_eq!(packet.id, 1);
        assert_eq!(packet.payload().unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn read_multiple_packets() {
        let data = wire(&[
            Packet::command(1, 1, 1, Bytes::new()),
            Packet::command(2, 1, 7, Bytes::new()),
            Packet::reply(3, vec![9; 100]),
        ]);
        let mut reader = PacketReader::new(&data[..]);
        assert_eq!(reader.read_packet().await.unwrap().id, 1);
        assert_eq!(reader.read_packet().await.unwrap().id, 2);
        assert_eq!(reader.read_packet().await.unwrap().payload_len(), 100);
        assert!(matches!(
            reader.read_packet().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn read_byte_by_byte() {
        let data = wire(&[Packet::reply(7, &b"split"[..])]);
        let (mut tx, rx) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            for b in data {
                tx.write_all(&[b]).await.unwrap();
            }
        });
        let mut reader = PacketReader::new(rx);
        let packet = reader.read_packet().await.unwrap();
        assert_eq!(packet.payload().unwrap().as_ref(), b"split");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_mid_packet_is_truncated() {
        let mut data = wire(&[Packet::reply(1, vec![1, 2, 3, 4])]);
        data.truncate(13);
        let mut reader = PacketReader::new(&data[..]);
        assert!(matches!(
            reader.read_packet().await,
            Err(FrameError::Truncated {
                expected: 15,
                received: 13
            })
        ));
    }

    #[tokio::test]
    async fn next_read_invalidates_previous_payload() {
        let data = wire(&[Packet::reply(1, &b"first"[..]), Packet::reply(2, &b"second"[..])]);
        let mut reader = PacketReader::new(&data[..]);
        let first = reader.read_packet().await.unwrap();
        let kept = first.detach().unwrap();
        let second = reader.read_packet().await.unwrap();

        assert!(matches!(
            first.payload(),
            Err(FrameError::PayloadUnavailable { id: 1 })
        ));
        assert_eq!(kept.payload().unwrap().as_ref(), b"first");
        assert_eq!(second.payload().unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn read_timeout_keeps_partial_bytes() {
        let data = wire(&[Packet::reply(5, &b"later"[..])]);
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&data[..6]).await.unwrap();

        let config = PacketConfig {
            read_timeout: Some(Duration::from_millis(20)),
            ..PacketConfig::default()
        };
        let mut reader = PacketReader::with_config(rx, config);
        assert!(matches!(
            reader.read_packet().await,
            Err(FrameError::Timeout(_))
        ));
        assert_eq!(reader.buffered().len(), 6);

        tx.write_all(&data[6..]).await.unwrap();
        let packet = reader.read_packet().await.unwrap();
        assert_eq!(packet.id, 5);
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected() {
        let data = wire(&[Packet::reply(1, vec![0; 64])]);
        let config = PacketConfig {
            max_packet_size: 32,
            ..PacketConfig::default()
        };
        let mut reader = PacketReader::with_config(&data[..], config);
        assert!(matches!(
            reader.read_packet().await,
            Err(FrameError::PacketTooLarge { size: 75, max: 32 })
        ));
    }
}
