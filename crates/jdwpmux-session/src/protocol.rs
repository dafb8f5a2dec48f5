//! JDWP and DDMS commands built on [`SharedJdwpSession`].
//!
//! Each helper opens a receiver whose activation sends the command, then
//! waits for the reply carrying the same id.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use jdwpmux_frame::{cmdset, ddms, Chunk, ChunkType, Packet};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::shared::SharedJdwpSession;

/// Whether a VM sends a reply to DDMS commands that have nothing to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DdmsProtocolKind {
    /// Empty replies are sent (API level 27 and lower).
    EmptyRepliesAllowed,
    /// Empty replies are discarded by the VM (API level 28 and up); only
    /// FAIL replies come back.
    EmptyRepliesDiscarded,
}

impl DdmsProtocolKind {
    pub fn from_api_level(api_level: u32) -> Self {
        if api_level >= 28 {
            Self::EmptyRepliesDiscarded
        } else {
            Self::EmptyRepliesAllowed
        }
    }
}

/// Hooks around one command exchange.
pub trait JdwpCommandProgress: Send + Sync {
    fn before_send(&self, _packet: &Packet) {}
    fn after_send(&self, _packet: &Packet) {}
    fn on_reply(&self, _packet: &Packet) {}
    fn on_reply_timeout(&self) {}
}

/// Progress hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl JdwpCommandProgress for NoProgress {}

fn no_progress() -> Arc<dyn JdwpCommandProgress> {
    Arc::new(NoProgress)
}

impl SharedJdwpSession {
    /// Send `command` and return its reply.
    pub async fn handle_jdwp_command(&self, command: Packet) -> Result<Packet> {
        self.handle_jdwp_command_with_progress(command, no_progress())
            .await
    }

    pub async fn handle_jdwp_command_with_progress(
        &self,
        command: Packet,
        progress: Arc<dyn JdwpCommandProgress>,
    ) -> Result<Packet> {
        let exchange = self.exchange(command, progress, None);
        match self.config().command_timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| SessionError::Timeout(timeout))?,
            None => exchange.await,
        }
    }

    /// Run one command/reply exchange. `sent` fires once the command is on the wire.
    async fn exchange(
        &self,
        command: Packet,
        progress: Arc<dyn JdwpCommandProgress>,
        sent: Option<oneshot::Sender<()>>,
    ) -> Result<Packet> {
        let id = command.id;
        let sender = self.clone();
        let activation_progress = progress.clone();
        let reply = self
            .new_packet_receiver()?
            .with_name(format!("command {id}"))
            .on_activation(move || async move {
                activation_progress.before_send(&command);
                sender.send_packet(&command).await?;
                activation_progress.after_send(&command);
                if let Some(sent) = sent {
                    let _ = sent.send(());
                }
                Ok(())
            })
            .receive_first(move |packet| packet.is_reply() && packet.id == id)
            .await?
            .ok_or(SessionError::EndOfStream)?;
        progress.on_reply(&reply);
        Ok(reply)
    }

    /// Send a DDMS chunk and return the reply chunk of the same type.
    pub async fn handle_ddms_command(&self, chunk: Chunk) -> Result<Chunk> {
        self.handle_ddms_command_with_progress(chunk, no_progress())
            .await
    }

    pub async fn handle_ddms_command_with_progress(
        &self,
        chunk: Chunk,
        progress: Arc<dyn JdwpCommandProgress>,
    ) -> Result<Chunk> {
        let chunk_type = chunk.chunk_type;
        debug!(pid = ?self.pid(), %chunk_type, "invoking DDMS command");
        let command = chunk.into_command(self.next_packet_id()?);
        let reply = self
            .handle_jdwp_command_with_progress(command, progress)
            .await?;
        expect_reply_chunk(&reply, chunk_type)
    }

    /// Send a DDMS chunk whose successful reply is empty.
    ///
    /// On VMs that discard empty replies, waiting `ddms_reply_timeout` after
    /// the command was sent without seeing a FAIL counts as success.
    pub async fn handle_ddms_command_with_empty_reply(&self, chunk: Chunk) -> Result<()> {
        self.handle_ddms_command_with_empty_reply_and_progress(chunk, no_progress())
            .await
    }

    pub async fn handle_ddms_command_with_empty_reply_and_progress(
        &self,
        chunk: Chunk,
        progress: Arc<dyn JdwpCommandProgress>,
    ) -> Result<()> {
        let chunk_type = chunk.chunk_type;
        debug!(pid = ?self.pid(), %chunk_type, "invoking DDMS command (empty reply)");
        let command = chunk.into_command(self.next_packet_id()?);
        match self.config().ddms_protocol_kind {
            DdmsProtocolKind::EmptyRepliesAllowed => {
                let reply = self
                    .handle_jdwp_command_with_progress(command, progress)
                    .await?;
                expect_empty_reply(&reply, chunk_type)
            }
            DdmsProtocolKind::EmptyRepliesDiscarded => {
                let timeout = self.config().ddms_reply_timeout;
                let (sent_tx, sent_rx) = oneshot::channel();
                let exchange = self.exchange(command, progress.clone(), Some(sent_tx));
                tokio::select! {
                    reply = exchange => expect_empty_reply(&reply?, chunk_type),
                    _ = timeout_after_signal(sent_rx, timeout) => {
                        debug!(pid = ?self.pid(), %chunk_type, ?timeout, "no reply, assuming success");
                        progress.on_reply_timeout();
                        Ok(())
                    }
                }
            }
        }
    }

    /// JDWP `VirtualMachine.Exit`. Does not wait for a reply.
    pub async fn send_vm_exit(&self, status: i32) -> Result<()> {
        let packet = Packet::command(
            self.next_packet_id()?,
            cmdset::VM,
            cmdset::VM_EXIT,
            i32_payload(status),
        );
        info!(pid = ?self.pid(), status, "sending VM exit");
        self.send_packet(&packet).await
    }

    /// DDMS `EXIT`, then wait for the VM to close the connection.
    pub async fn send_ddms_exit(&self, status: i32) -> Result<()> {
        let packet = ddms::exit_request(status).into_command(self.next_packet_id()?);
        let sender = self.clone();
        info!(pid = ?self.pid(), status, "sending DDMS exit");
        self.new_packet_receiver()?
            .with_name("ddms exit")
            .on_activation(move || async move { sender.send_packet(&packet).await })
            .receive_to_end()
            .await
    }

    /// DDMS `HPGC`: run a garbage collection.
    pub async fn ddms_hpgc(&self) -> Result<()> {
        self.handle_ddms_command_with_empty_reply(Chunk::new(ChunkType::Hpgc, Bytes::new()))
            .await
    }

    /// DDMS `REAE`: enable or disable allocation tracking.
    pub async fn ddms_reae(&self, enabled: bool) -> Result<()> {
        self.handle_ddms_command_with_empty_reply(ddms::reae_request(enabled))
            .await
    }

    /// DDMS `REAQ`: whether allocation tracking is enabled.
    pub async fn ddms_reaq(&self) -> Result<bool> {
        let reply = self
            .handle_ddms_command(Chunk::new(ChunkType::Reaq, Bytes::new()))
            .await?;
        Ok(ddms::parse_status_byte(&reply).map_err(protocol_error)? != 0)
    }

    /// DDMS `REAL`: the raw recent allocation list.
    pub async fn ddms_real(&self) -> Result<Bytes> {
        let reply = self
            .handle_ddms_command(Chunk::new(ChunkType::Real, Bytes::new()))
            .await?;
        Ok(reply.payload)
    }

    /// DDMS `MPRQ`: method profiling status byte.
    pub async fn ddms_mprq(&self) -> Result<u8> {
        let reply = self
            .handle_ddms_command(Chunk::new(ChunkType::Mprq, Bytes::new()))
            .await?;
        ddms::parse_status_byte(&reply).map_err(protocol_error)
    }

    /// DDMS `MPSS`: start streaming method profiling.
    pub async fn ddms_mpss(&self, buffer_size: i32, flags: i32) -> Result<()> {
        self.handle_ddms_command_with_empty_reply(ddms::mpss_request(buffer_size, flags))
            .await
    }

    /// DDMS `MPSE`: stop method profiling and return the trace data.
    pub async fn ddms_mpse(&self) -> Result<Bytes> {
        let reply = self
            .handle_ddms_command(Chunk::new(ChunkType::Mpse, Bytes::new()))
            .await?;
        Ok(reply.payload)
    }

    /// DDMS `SPSS`: start sampling profiling.
    pub async fn ddms_spss(&self, buffer_size: i32, interval: Duration) -> Result<()> {
        let interval_us = i32::try_from(interval.as_micros()).unwrap_or(i32::MAX);
        self.handle_ddms_command_with_empty_reply(ddms::spss_request(buffer_size, 0, interval_us))
            .await
    }

    /// DDMS `SPSE`: stop sampling profiling and return the trace data.
    pub async fn ddms_spse(&self) -> Result<Bytes> {
        let reply = self
            .handle_ddms_command(Chunk::new(ChunkType::Spse, Bytes::new()))
            .await?;
        Ok(reply.payload)
    }
}

/// Sleep for `timeout`, starting only once `signal` fires. Pending forever
/// if the signal is dropped without firing.
async fn timeout_after_signal(signal: oneshot::Receiver<()>, timeout: Duration) {
    if signal.await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(timeout).await;
}

fn protocol_error(err: jdwpmux_frame::FrameError) -> SessionError {
    SessionError::DdmsProtocol(err.to_string())
}

fn reply_chunks(reply: &Packet) -> Result<Vec<Chunk>> {
    if reply.error_code() != 0 {
        return Err(SessionError::CommandFailed {
            id: reply.id,
            error_code: reply.error_code(),
        });
    }
    let payload = reply.payload()?;
    jdwpmux_frame::decode_chunks(&payload).map_err(protocol_error)
}

fn fail_error(chunk: &Chunk) -> SessionError {
    match ddms::FailReply::parse(chunk) {
        Ok(fail) => SessionError::DdmsFailed {
            code: fail.error_code,
            message: fail.message,
        },
        Err(err) => protocol_error(err),
    }
}

fn expect_reply_chunk(reply: &Packet, expected: ChunkType) -> Result<Chunk> {
    let mut chunks = reply_chunks(reply)?.into_iter();
    match chunks.next() {
        None => Err(SessionError::DdmsProtocol(format!(
            "reply to {expected} contained no chunk"
        ))),
        Some(chunk) if chunk.chunk_type == ChunkType::Fail => Err(fail_error(&chunk)),
        Some(chunk) if chunk.chunk_type == expected => Ok(chunk),
        Some(chunk) => Err(SessionError::DdmsProtocol(format!(
            "reply to {expected} contained a {} chunk",
            chunk.chunk_type
        ))),
    }
}

fn expect_empty_reply(reply: &Packet, expected: ChunkType) -> Result<()> {
    let chunks = reply_chunks(reply)?;
    if let Some(fail) = chunks.iter().find(|c| c.chunk_type == ChunkType::Fail) {
        info!(%expected, "DDMS command failed");
        return Err(fail_error(fail));
    }
    if reply.payload_len() != 0 {
        return Err(SessionError::DdmsProtocol(format!(
            "reply to {expected} was expected to be empty, but contained {} bytes",
            reply.payload_len()
        )));
    }
    Ok(())
}

/// Build a HELO request packet.
pub fn helo_packet(id: u32) -> Packet {
    ddms::helo_request().into_command(id)
}

/// Build a FEAT request packet.
pub fn feat_packet(id: u32) -> Packet {
    ddms::feat_request().into_command(id)
}

/// Payload of a JDWP packet made of one `i32`.
pub fn i32_payload(value: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32(value);
    buf.freeze()
}
