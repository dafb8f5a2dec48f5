//! An in-memory VM that speaks enough JDWP and DDMS for tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use jdwpmux_frame::ddms::{self, ApnmEvent, FailReply, HeloReply, WaitEvent};
use jdwpmux_frame::{cmdset, Chunk, ChunkType, Packet, PacketReader, PacketWriter};
use jdwpmux_transport::JdwpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handshake::{handshake_server, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::session::{JdwpSession, SessionConfig};
use crate::shared::{SharedJdwpSession, SharedSessionConfig};

/// How the fake VM describes itself and answers commands.
#[derive(Debug, Clone)]
pub struct FakeVmConfig {
    pub pid: u32,
    /// Name reported in the HELO reply.
    pub process_name: String,
    pub package_name: Option<String>,
    pub user_id: Option<i32>,
    pub vm_identifier: String,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
    pub native_debuggable: bool,
    pub features: Vec<String>,
    /// Send an APNM event with this name right after the HELO reply.
    pub apnm_after_helo: Option<String>,
    /// Send a WAIT event right after the HELO reply.
    pub wait_after_helo: bool,
    /// Answer empty-reply DDMS commands (HPGC, REAE, MPSS, SPSS) with an empty reply.
    pub empty_ddms_replies: bool,
    /// Answer these chunk types with a FAIL chunk.
    pub fail_chunks: Vec<ChunkType>,
    /// Delay before each reply.
    pub reply_delay: Duration,
}

impl Default for FakeVmConfig {
    fn default() -> Self {
        Self {
            pid: 1234,
            process_name: "com.example.app".to_string(),
            package_name: Some("com.example.app".to_string()),
            user_id: Some(0),
            vm_identifier: "FakeVM 1.0".to_string(),
            abi: Some("arm64-v8a".to_string()),
            jvm_flags: Some(String::new()),
            native_debuggable: false,
            features: vec!["method-trace-profiling".to_string()],
            apnm_after_helo: None,
            wait_after_helo: false,
            empty_ddms_replies: true,
            fail_chunks: Vec::new(),
            reply_delay: Duration::ZERO,
        }
    }
}

enum VmAction {
    Send(Packet),
    Close,
}

/// Handle to a running fake VM. Dropping it closes the VM's connection.
pub struct FakeVm {
    actions: mpsc::UnboundedSender<VmAction>,
    received: Arc<Mutex<Vec<Packet>>>,
    next_id: Arc<AtomicU32>,
    task: Option<JoinHandle<()>>,
}

impl FakeVm {
    /// Serve the VM side of `stream`.
    pub fn spawn(stream: JdwpStream, config: FakeVmConfig) -> Self {
        let (actions, actions_rx) = mpsc::unbounded_channel();
        let received = Arc::new(Mutex::new(Vec::new()));
        let next_id = Arc::new(AtomicU32::new(1));
        let task = tokio::spawn(run_vm(
            stream,
            config,
            actions_rx,
            received.clone(),
            next_id.clone(),
        ));
        Self {
            actions,
            received,
            next_id,
            task: Some(task),
        }
    }

    /// The host end of a fresh in-memory connection to a new fake VM.
    pub fn pair(config: FakeVmConfig) -> (JdwpStream, Self) {
        let (host, vm) = JdwpStream::pair();
        (host, Self::spawn(vm, config))
    }

    /// Send a packet from the VM to the host.
    pub fn send(&self, packet: Packet) {
        let _ = self.actions.send(VmAction::Send(packet));
    }

    /// Send a DDMS chunk as a VM-originated command.
    pub fn send_chunk(&self, chunk: Chunk) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(chunk.into_command(id));
    }

    /// Close the connection as if the process died.
    pub fn close(&self) {
        let _ = self.actions.send(VmAction::Close);
    }

    /// Every packet received from the host so far.
    pub fn received(&self) -> Vec<Packet> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the VM has received at least `count` packets.
    pub async fn wait_for_received(&self, count: usize) -> Vec<Packet> {
        loop {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait for the VM task to finish.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FakeVm {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A shared session connected to a new fake VM.
pub async fn shared_session(config: FakeVmConfig) -> (SharedJdwpSession, FakeVm) {
    shared_session_with_config(config, SharedSessionConfig::default()).await
}

pub async fn shared_session_with_config(
    vm_config: FakeVmConfig,
    config: SharedSessionConfig,
) -> (SharedJdwpSession, FakeVm) {
    let pid = vm_config.pid;
    let (host, vm) = FakeVm::pair(vm_config);
    let session = match JdwpSession::connect(host, SessionConfig::default()).await {
        Ok(session) => session,
        Err(err) => panic!("fake VM handshake failed: {err}"),
    };
    let shared = SharedJdwpSession::builder(session)
        .with_config(config)
        .with_pid(pid)
        .build();
    (shared, vm)
}

async fn run_vm(
    mut stream: JdwpStream,
    config: FakeVmConfig,
    mut actions: mpsc::UnboundedReceiver<VmAction>,
    received: Arc<Mutex<Vec<Packet>>>,
    next_id: Arc<AtomicU32>,
) {
    if handshake_server(&mut stream, DEFAULT_HANDSHAKE_TIMEOUT)
        .await
        .is_err()
    {
        return;
    }
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = PacketReader::new(read_half);
    let mut writer = PacketWriter::new(write_half);

    loop {
        tokio::select! {
            action = actions.recv() => match action {
                Some(VmAction::Send(packet)) => {
                    if writer.write_packet(&packet).await.is_err() {
                        break;
                    }
                }
                Some(VmAction::Close) | None => break,
            },
            packet = reader.read_packet() => {
                let Ok(packet) = packet.and_then(|p| p.detach()) else {
                    break;
                };
                received
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(packet.clone());
                let (replies, exit) = respond(&config, &packet, &next_id);
                if !replies.is_empty() && !config.reply_delay.is_zero() {
                    tokio::time::sleep(config.reply_delay).await;
                }
                for reply in replies {
                    if writer.write_packet(&reply).await.is_err() {
                        return;
                    }
                }
                if exit {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn respond(config: &FakeVmConfig, packet: &Packet, next_id: &AtomicU32) -> (Vec<Packet>, bool) {
    if packet.is_reply() {
        return (Vec::new(), false);
    }
    if packet.cmd_set() == Some(cmdset::VM) && packet.cmd() == Some(cmdset::VM_EXIT) {
        return (Vec::new(), true);
    }
    if !packet.is_ddms_command() {
        return (vec![Packet::reply(packet.id, Bytes::from_static(b"ok"))], false);
    }

    let Ok(chunks) = packet.ddms_chunks() else {
        return (vec![Packet::error_reply(packet.id, 100)], false);
    };
    let mut replies = Vec::new();
    for chunk in chunks {
        let id = packet.id;
        if config.fail_chunks.contains(&chunk.chunk_type) {
            replies.push(fail(id, 2, "command rejected"));
            continue;
        }
        match chunk.chunk_type {
            ChunkType::Helo => {
                replies.push(helo(config).to_chunk().into_reply(id));
                if let Some(name) = &config.apnm_after_helo {
                    let event = ApnmEvent {
                        process_name: name.clone(),
                        user_id: config.user_id,
                        package_name: config.package_name.clone(),
                    };
                    replies.push(event.to_chunk().into_command(next_id.fetch_add(1, Ordering::Relaxed)));
                }
                if config.wait_after_helo {
                    let wait = WaitEvent {
                        reason: ddms::WAIT_FOR_DEBUGGER,
                    };
                    replies.push(wait.to_chunk().into_command(next_id.fetch_add(1, Ordering::Relaxed)));
                }
            }
            ChunkType::Feat => {
                replies.push(ddms::features_chunk(&config.features).into_reply(id));
            }
            ChunkType::Hpgc | ChunkType::Reae | ChunkType::Mpss | ChunkType::Spss => {
                if config.empty_ddms_replies {
                    replies.push(Packet::reply(id, Bytes::new()));
                }
            }
            ChunkType::Reaq => replies.push(Chunk::new(ChunkType::Reaq, vec![1]).into_reply(id)),
            ChunkType::Mprq => replies.push(Chunk::new(ChunkType::Mprq, vec![0]).into_reply(id)),
            ChunkType::Real | ChunkType::Mpse | ChunkType::Spse => replies.push(
                Chunk::new(chunk.chunk_type, Bytes::from_static(b"trace-data")).into_reply(id),
            ),
            ChunkType::Exit => return (replies, true),
            _ => replies.push(fail(id, 1, "unsupported chunk")),
        }
    }
    (replies, false)
}

fn helo(config: &FakeVmConfig) -> HeloReply {
    HeloReply {
        protocol_version: 1,
        pid: config.pid as i32,
        vm_identifier: config.vm_identifier.clone(),
        process_name: config.process_name.clone(),
        user_id: config.user_id,
        abi: config.abi.clone(),
        jvm_flags: config.jvm_flags.clone(),
        is_native_debuggable: Some(config.native_debuggable),
        package_name: config.package_name.clone(),
    }
}

fn fail(id: u32, code: i32, message: &str) -> Packet {
    FailReply {
        error_code: code,
        message: message.to_string(),
    }
    .to_chunk()
    .into_reply(id)
}
