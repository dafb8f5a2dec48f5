use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use jdwpmux_frame::cmdset::FIRST_CLIENT_PACKET_ID;
use jdwpmux_frame::{Packet, PacketConfig, PacketReader, PacketWriter};
use jdwpmux_transport::JdwpStream;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, SessionError};
use crate::handshake::{handshake_client, handshake_server, DEFAULT_HANDSHAKE_TIMEOUT};

/// Configuration for a [`JdwpSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Packet size limit and per-packet read/write timeouts.
    pub packet: PacketConfig,
    /// Bound on the `JDWP-Handshake` exchange.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            packet: PacketConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// One JDWP connection with a single consumer.
///
/// Sends are serialized internally. Receives are serialized too, but the
/// payload of a received packet is only valid until the next receive.
pub struct JdwpSession {
    reader: Mutex<PacketReader<ReadHalf<JdwpStream>>>,
    writer: Mutex<PacketWriter<WriteHalf<JdwpStream>>>,
    next_id: Option<AtomicU32>,
    shutdown: CancellationToken,
    end_of_stream: AtomicBool,
    peer: Option<SocketAddr>,
}

impl JdwpSession {
    /// Open a session to a VM (client side of the handshake).
    ///
    /// The host allocates packet ids on this session.
    pub async fn connect(mut stream: JdwpStream, config: SessionConfig) -> Result<Self> {
        handshake_client(&mut stream, config.handshake_timeout).await?;
        Ok(Self::from_stream(stream, config, true))
    }

    /// Open a session to a debugger (server side of the handshake).
    ///
    /// The debugger allocates packet ids on this session, so
    /// [`JdwpSession::next_packet_id`] is unsupported.
    pub async fn accept(mut stream: JdwpStream, config: SessionConfig) -> Result<Self> {
        handshake_server(&mut stream, config.handshake_timeout).await?;
        Ok(Self::from_stream(stream, config, false))
    }

    fn from_stream(stream: JdwpStream, config: SessionConfig, allocates_ids: bool) -> Self {
        let peer = stream.peer_addr();
        let (read_half, write_half) = tokio::io::split(stream);
        debug!(?peer, allocates_ids, "jdwp session opened");
        Self {
            reader: Mutex::new(PacketReader::with_config(read_half, config.packet.clone())),
            writer: Mutex::new(PacketWriter::with_config(write_half, config.packet)),
            next_id: allocates_ids.then(|| AtomicU32::new(FIRST_CLIENT_PACKET_ID)),
            shutdown: CancellationToken::new(),
            end_of_stream: AtomicBool::new(false),
            peer,
        }
    }

    /// A packet id not returned before on this session.
    pub fn next_packet_id(&self) -> Result<u32> {
        match &self.next_id {
            Some(next) => Ok(next.fetch_add(1, Ordering::Relaxed)),
            None => Err(SessionError::Unsupported(
                "packet ids are allocated by the remote debugger on this session",
            )),
        }
    }

    /// Write one packet.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.check_shutdown()?;
        let mut writer = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(SessionError::Shutdown),
            writer = self.writer.lock() => writer,
        };
        trace!(%packet, "sending packet");
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(SessionError::Shutdown),
            result = writer.write_packet(packet) => result,
        };
        result.map_err(|err| {
            if writer.is_poisoned() {
                debug!(peer = ?self.peer, error = %err, "write stopped mid-packet, sends disabled");
            }
            self.map_io(err.into())
        })
    }

    /// Read the next packet.
    ///
    /// Its payload is invalidated by the next call.
    pub async fn receive_packet(&self) -> Result<Packet> {
        self.check_shutdown()?;
        if self.end_of_stream.load(Ordering::Acquire) {
            return Err(SessionError::EndOfStream);
        }
        let mut reader = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(SessionError::Shutdown),
            reader = self.reader.lock() => reader,
        };
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(SessionError::Shutdown),
            result = reader.read_packet() => result,
        };
        match result {
            Ok(packet) => {
                trace!(%packet, "received packet");
                Ok(packet)
            }
            Err(err) => {
                let err = self.map_io(err.into());
                if err.is_end_of_stream() {
                    debug!(peer = ?self.peer, "jdwp session reached end of stream");
                    self.end_of_stream.store(true, Ordering::Release);
                }
                Err(err)
            }
        }
    }

    /// Fail every in-flight and future send/receive. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(peer = ?self.peer, "jdwp session shut down");
            self.shutdown.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Remote address, when the transport is a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Shutdown);
        }
        Ok(())
    }

    // An I/O failure racing a local shutdown reports the shutdown.
    fn map_io(&self, err: SessionError) -> SessionError {
        if self.shutdown.is_cancelled() {
            SessionError::Shutdown
        } else {
            err
        }
    }
}

impl std::fmt::Debug for JdwpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JdwpSession")
            .field("peer", &self.peer)
            .field("allocates_ids", &self.next_id.is_some())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
