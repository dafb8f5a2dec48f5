use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::{encode_packet, PacketConfig};
use crate::error::{FrameError, Result};
use crate::packet::Packet;

/// Writes complete packets to any `AsyncWrite` stream.
///
/// A write that fails, times out or is cancelled midway leaves a partial
/// frame on the wire. The writer is then poisoned and every later write
/// fails with [`FrameError::Poisoned`].
pub struct PacketWriter<W> {
    inner: W,
    buf: BytesMut,
    config: PacketConfig,
    poisoned: bool,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Create a new packet writer with default configuration.
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, PacketConfig::default())
    }

    /// Create a new packet writer with explicit configuration.
    pub fn with_config(inner: W, config: PacketConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            config,
            poisoned: false,
        }
    }

    /// Whether an earlier write stopped partway through a frame.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Encode and write one packet, then flush.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        if packet.length() > self.config.max_packet_size {
            return Err(FrameError::PacketTooLarge {
                size: packet.length(),
                max: self.config.max_packet_size,
            });
        }
        self.buf.clear();
        encode_packet(packet, &mut self.buf)?;
        // Cleared only once the whole frame is out; a dropped future keeps it set.
        self.poisoned = true;
        match self.config.write_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.flush_buffer())
                .await
                .map_err(|_| FrameError::Timeout(timeout))??,
            None => self.flush_buffer().await?,
        }
        self.poisoned = false;
        Ok(())
    }

    async fn flush_buffer(&mut self) -> Result<()> {
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write raw bytes, bypassing framing. Used for the connection handshake.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::codec::JdwpCodec;
    use crate::PacketReader;

    #[tokio::test]
    async fn write_then_read() {
        let (tx, rx) = tokio::io::duplex(1024);
        let mut writer = PacketWriter::new(tx);
        writer
            .write_packet(&Packet::command(1, 1, 1, &b"abc"[..]))
            .await
            .unwrap();
        writer.write_packet(&Packet::error_reply(2, 13)).await.unwrap();

        let mut reader = PacketReader::new(rx);
        let a = reader.read_packet().await.unwrap();
        assert_eq!(a.payload().unwrap().as_ref(), b"abc");
        let b = reader.read_packet().await.unwrap();
        assert_eq!(b.error_code(), 13);
    }

    #[tokio::test]
    async fn framed_read_with_codec() {
        let (tx, rx) = tokio::io::duplex(1024);
        let mut writer = PacketWriter::new(tx);
        for id in 1..=3 {
            writer.write_packet(&Packet::reply(id, vec![id as u8])).await.unwrap();
        }
        drop(writer);

        let ids: Vec<u32> = FramedRead::new(rx, JdwpCodec::new())
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn writer_rejects_oversized_packet() {
        let (tx, _rx) = tokio::io::duplex(1024);
        let config = PacketConfig {
            max_packet_size: 16,
            ..PacketConfig::default()
        };
        let mut writer = PacketWriter::with_config(tx, config);
        let err = writer
            .write_packet(&Packet::reply(1, vec![0; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::PacketTooLarge { size: 43, max: 16 }));
    }

    #[tokio::test]
    async fn timed_out_write_poisons_writer() {
        let (tx, mut rx) = tokio::io::duplex(64);
        let config = PacketConfig {
            write_timeout: Some(std::time::Duration::from_millis(20)),
            ..PacketConfig::default()
        };
        let mut writer = PacketWriter::with_config(tx, config);
        let err = writer
            .write_packet(&Packet::reply(1, vec![7; 1000]))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Timeout(_)));
        assert!(writer.is_poisoned());

        let err = writer
            .write_packet(&Packet::reply(2, &b"abc"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Poisoned));
        assert!(err.is_fatal());

        // Only the first 64 bytes of packet 1 ever reached the wire.
        let mut buf = [0u8; 64];
        tokio::io::AsyncReadExt::read_exact(&mut rx, &mut buf).await.unwrap();
        assert!(buf[11..].iter().all(|b| *b == 7));
    }

    #[tokio::test]
    async fn cancelled_write_poisons_writer() {
        let (tx, _rx) = tokio::io::duplex(16);
        let mut writer = PacketWriter::new(tx);
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            writer.write_packet(&Packet::reply(1, vec![0; 256])),
        )
        .await;
        assert!(pending.is_err());
        assert!(matches!(
            writer.write_packet(&Packet::reply(2, vec![])).await,
            Err(FrameError::Poisoned)
        ));
    }

    #[tokio::test]
    async fn write_raw_bypasses_framing() {
        let (tx, mut rx) = tokio::io::duplex(64);
        let mut writer = PacketWriter::new(tx);
        writer.write_raw(b"JDWP-Handshake").await.unwrap();
        let mut buf = [0u8; 14];
        tokio::io::AsyncReadExt::read_exact(&mut rx, &mut buf).await.unwrap();
        assert_eq!(&buf, b"JDWP-Handshake");
    }
}
