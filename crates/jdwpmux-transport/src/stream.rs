use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// Default buffer size of each direction of an in-memory pair.
pub const DEFAULT_MEMORY_CAPACITY: usize = 64 * 1024;

/// A duplex byte channel.
///
/// Wraps the concrete transport so the framing and session layers can stay
/// generic over one type.
pub struct JdwpStream {
    inner: StreamInner,
}

enum StreamInner {
    Tcp(TcpStream),
    Memory(DuplexStream),
}

impl JdwpStream {
    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        Self {
            inner: StreamInner::Tcp(stream),
        }
    }

    /// A connected in-memory pair. Bytes written to one end are read from the other.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    /// Same as [`JdwpStream::pair`] with an explicit per-direction buffer size.
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            Self {
                inner: StreamInner::Memory(a),
            },
            Self {
                inner: StreamInner::Memory(b),
            },
        )
    }

    /// Remote address, if this is a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            StreamInner::Tcp(s) => s.peer_addr().ok(),
            StreamInner::Memory(_) => None,
        }
    }

    /// Human-readable name of the transport kind.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            StreamInner::Tcp(_) => "tcp",
            StreamInner::Memory(_) => "memory",
        }
    }
}

impl AsyncRead for JdwpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            StreamInner::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            StreamInner::Memory(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for JdwpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().inner {
            StreamInner::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            StreamInner::Memory(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            StreamInner::Tcp(s) => Pin::new(s).poll_flush(cx),
            StreamInner::Memory(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            StreamInner::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            StreamInner::Memory(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for JdwpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JdwpStream")
            .field("transport", &self.transport_name())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_pair_is_duplex() {
        let (mut a, mut b) = JdwpStream::pair();
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn dropping_one_end_is_eof() {
        let (a, mut b) = JdwpStream::pair();
        drop(a);
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn memory_has_no_peer_addr() {
        let (a, _b) = JdwpStream::pair();
        assert_eq!(a.peer_addr(), None);
        assert_eq!(a.transport_name(), "memory");
        assert!(format!("{a:?}").contains("memory"));
    }
}
