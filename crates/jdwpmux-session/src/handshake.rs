use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Result, SessionError};

/// The 14 ASCII bytes both sides exchange before any packet.
pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

/// Default bound on the whole handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side: send the handshake and wait for the VM to echo it.
pub async fn handshake_client<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(timeout, async {
        stream.write_all(HANDSHAKE).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)?;
        expect_handshake(stream).await?;
        debug!("client handshake complete");
        Ok(())
    })
    .await
}

/// Server side: wait for a debugger's handshake and echo it.
pub async fn handshake_server<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(timeout, async {
        expect_handshake(stream).await?;
        stream.write_all(HANDSHAKE).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)?;
        debug!("server handshake complete");
        Ok(())
    })
    .await
}

async fn expect_handshake<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    let mut buf = [0u8; HANDSHAKE.len()];
    stream.read_exact(&mut buf).await.map_err(io_error)?;
    if &buf != HANDSHAKE {
        return Err(SessionError::HandshakeFailed(format!(
            "unexpected handshake bytes {:?}",
            String::from_utf8_lossy(&buf)
        )));
    }
    Ok(())
}

async fn with_timeout<F>(timeout: Duration, fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SessionError::Timeout(timeout))?
}

fn io_error(err: std::io::Error) -> SessionError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        SessionError::EndOfStream
    } else {
        jdwpmux_transport::TransportError::Io(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jdwpmux_transport::JdwpStream;

    #[tokio::test]
    async fn client_and_server_agree() {
        let (mut client, mut server) = JdwpStream::pair();
        let server_task =
            tokio::spawn(async move { handshake_server(&mut server, DEFAULT_HANDSHAKE_TIMEOUT).await });
        handshake_client(&mut client, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
            .unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_reply_fails() {
        let (mut client, mut server) = JdwpStream::pair();
        tokio::spawn(async move {
            let mut buf = [0u8; 14];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(b"JDWP-Handshaky").await.unwrap();
            server
        });
        let err = handshake_client(&mut client, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn closed_during_handshake_is_end_of_stream() {
        let (mut client, server) = JdwpStream::pair();
        drop(server);
        let err = handshake_client(&mut client, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_end_of_stream() || matches!(err, SessionError::Transport(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (mut client, _server) = JdwpStream::pair();
        let err = handshake_client(&mut client, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }
}
