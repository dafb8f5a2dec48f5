use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::JdwpStream;

/// A listening TCP socket handing out [`JdwpStream`]s.
///
/// Binding to port 0 lets the OS assign the port; [`TcpEndpoint::local_addr`]
/// reports the result and stays the same for the endpoint's lifetime.
#[derive(Debug)]
pub struct TcpEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpEndpoint {
    /// Loopback with an OS-assigned port.
    pub const LOOPBACK_ANY: SocketAddr =
        SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0));

    /// Bind and listen on `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind { addr, source: e })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Bind { addr, source: e })?;
        info!(%local_addr, "listening on tcp socket");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Wait for the next incoming connection.
    pub async fn accept(&self) -> Result<(JdwpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        debug!(%peer, local_addr = %self.local_addr, "accepted tcp connection");
        Ok((JdwpStream::from_tcp(stream), peer))
    }

    /// Connect to a listening socket.
    pub async fn connect(addr: SocketAddr) -> Result<JdwpStream> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect { addr, source: e })?;
        debug!(%addr, "connected tcp socket");
        Ok(JdwpStream::from_tcp(stream))
    }

    /// Connect, giving up after `timeout`.
    pub async fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<JdwpStream> {
        match tokio::time::timeout(timeout, Self::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout { addr, timeout }),
        }
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let endpoint = TcpEndpoint::bind(TcpEndpoint::LOOPBACK_ANY).await.unwrap();
        let addr = endpoint.local_addr();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move {
            let mut stream = TcpEndpoint::connect(addr).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            stream
        });

        let (mut server, peer) = endpoint.accept().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(server.peer_addr(), Some(peer));
        assert_eq!(server.transport_name(), "tcp");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let endpoint = TcpEndpoint::bind(TcpEndpoint::LOOPBACK_ANY).await.unwrap();
            endpoint.local_addr()
        };
        let err = TcpEndpoint::connect(addr).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn test_disconnect_classification() {
        let eof = TransportError::Io(std::io::ErrorKind::UnexpectedEof.into());
        assert!(eof.is_disconnect());
        assert!(TransportError::Shutdown.is_disconnect());
        let other = TransportError::Io(std::io::ErrorKind::InvalidData.into());
        assert!(!other.is_disconnect());
    }
}
