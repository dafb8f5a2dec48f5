//! Bridge a [`SharedJdwpSession`] to one external debugger at a time.
//!
//! The proxy listens on a TCP socket. Packets from the debugger go to the
//! shared session; packets from the VM go back to the debugger through the
//! [`FilterId::NO_DDMS`] filter, minus replies to commands the debugger
//! never sent.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use jdwpmux_frame::Packet;
use jdwpmux_transport::TcpEndpoint;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::filter::FilterId;
use crate::session::{JdwpSession, SessionConfig};
use crate::shared::SharedJdwpSession;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for a [`JdwpSessionProxy`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address. Port 0 lets the OS choose.
    pub bind_addr: SocketAddr,
    /// Settings for the debugger-side session.
    pub session: SessionConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: TcpEndpoint::LOOPBACK_ANY,
            session: SessionConfig::default(),
        }
    }
}

/// Where the proxy listens and who is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    pub listen_addr: SocketAddr,
    pub external_debugger: Option<SocketAddr>,
}

impl ProxyStatus {
    pub fn is_attached(&self) -> bool {
        self.external_debugger.is_some()
    }
}

/// A running debugger proxy. Dropping it stops the proxy.
///
/// A second debugger connecting while one is attached waits in the listen
/// backlog until the first detaches.
pub struct JdwpSessionProxy {
    local_addr: SocketAddr,
    status: watch::Receiver<ProxyStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl JdwpSessionProxy {
    /// Bind the listen socket and start serving debuggers for `shared`.
    pub async fn start(shared: SharedJdwpSession, config: ProxyConfig) -> Result<Self> {
        let endpoint = TcpEndpoint::bind(config.bind_addr).await?;
        let local_addr = endpoint.local_addr();
        let (status_tx, status) = watch::channel(ProxyStatus {
            listen_addr: local_addr,
            external_debugger: None,
        });
        let cancel = shared.inner.cancel_token().child_token();
        info!(pid = ?shared.pid(), %local_addr, "debugger proxy started");
        let task = tokio::spawn(run_proxy(
            endpoint,
            shared,
            config.session,
            status_tx,
            cancel.clone(),
        ));
        Ok(Self {
            local_addr,
            status,
            cancel,
            task,
        })
    }

    /// The listen address. Stable for the proxy's lifetime.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> ProxyStatus {
        self.status.borrow().clone()
    }

    /// Notified exactly when a debugger attaches or detaches.
    pub fn subscribe_status(&self) -> watch::Receiver<ProxyStatus> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting debuggers and detach the current one.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the proxy has stopped.
    pub async fn stopped(&self) {
        let mut status = self.status.clone();
        while status.changed().await.is_ok() {}
    }
}

impl Drop for JdwpSessionProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for JdwpSessionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JdwpSessionProxy")
            .field("local_addr", &self.local_addr)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

async fn run_proxy(
    endpoint: TcpEndpoint,
    shared: SharedJdwpSession,
    config: SessionConfig,
    status: watch::Sender<ProxyStatus>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.terminated() => break,
            accepted = endpoint.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accepting debugger connection failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let external = match JdwpSession::accept(stream, config.clone()).await {
            Ok(session) => session,
            Err(err) => {
                warn!(%peer, error = %err, "debugger handshake failed");
                continue;
            }
        };

        info!(pid = ?shared.pid(), %peer, "external debugger attached");
        set_debugger(&status, Some(peer));
        match bridge(&shared, external, &cancel).await {
            Ok(()) => {}
            Err(err) if err.is_end_of_stream() => {}
            Err(err) => debug!(%peer, error = %err, "debugger bridge ended"),
        }
        set_debugger(&status, None);
        info!(pid = ?shared.pid(), %peer, "external debugger detached");

        if cancel.is_cancelled() || shared.is_terminated() {
            break;
        }
    }
    debug!(pid = ?shared.pid(), "debugger proxy stopped");
}

fn set_debugger(status: &watch::Sender<ProxyStatus>, debugger: Option<SocketAddr>) {
    status.send_if_modified(|status| {
        let changed = status.external_debugger != debugger;
        status.external_debugger = debugger;
        changed
    });
}

/// Forward packets both ways until either side ends.
async fn bridge(
    shared: &SharedJdwpSession,
    external: JdwpSession,
    cancel: &CancellationToken,
) -> Result<()> {
    let external = Arc::new(external);
    let pending = Arc::new(Mutex::new(HashSet::new()));

    let to_debugger = {
        let external = external.clone();
        let pending = pending.clone();
        shared
            .new_packet_receiver()?
            .with_name("debugger proxy")
            .with_filter(FilterId::NO_DDMS)
            .receive(move |packet| {
                let external = external.clone();
                let forward = should_forward(&packet, &pending);
                async move {
                    if forward {
                        external.send_packet(&packet).await?;
                    }
                    Ok::<_, SessionError>(ControlFlow::<()>::Continue(()))
                }
            })
    };

    let from_debugger = async {
        loop {
            let packet = external.receive_packet().await?;
            if packet.is_command() {
                lock(&pending).insert(packet.id);
            }
            shared.send_packet(&packet).await?;
        }
    };

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(()),
        result = to_debugger => result.map(|_| ()),
        result = from_debugger => result,
    };
    external.shutdown();
    result
}

/// Replies reach the debugger only for commands it sent itself.
fn should_forward(packet: &Packet, pending: &Mutex<HashSet<u32>>) -> bool {
    !packet.is_reply() || lock(pending).remove(&packet.id)
}

fn lock(pending: &Mutex<HashSet<u32>>) -> std::sync::MutexGuard<'_, HashSet<u32>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeVmConfig};
    use bytes::Bytes;
    use jdwpmux_frame::cmdset;
    use jdwpmux_frame::ddms::WaitEvent;

    const WAIT: Duration = Duration::from_secs(5);

    async fn attach(proxy: &JdwpSessionProxy) -> JdwpSession {
        let stream = TcpEndpoint::connect(proxy.local_addr()).await.unwrap();
        JdwpSession::connect(stream, SessionConfig::default())
            .await
            .unwrap()
    }

    async fn wait_for_status(
        status: &mut watch::Receiver<ProxyStatus>,
        attached: bool,
    ) -> ProxyStatus {
        tokio::time::timeout(WAIT, status.wait_for(|s| s.is_attached() == attached))
            .await
            .unwrap()
            .unwrap()
            .clone()
    }

    async fn receive(debugger: &JdwpSession) -> Packet {
        tokio::time::timeout(WAIT, debugger.receive_packet())
            .await
            .unwrap()
            .unwrap()
            .detach()
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwards_debugger_commands_and_replies() {
        let (shared, vm) = testing::shared_session(FakeVmConfig::default()).await;
        let proxy = JdwpSessionProxy::start(shared.clone(), ProxyConfig::default())
            .await
            .unwrap();
        let debugger = attach(&proxy).await;

        let command = Packet::command(7, cmdset::VM, cmdset::VM_VERSION, Bytes::new());
        debugger.send_packet(&command).await.unwrap();

        let reply = receive(&debugger).await;
        assert!(reply.is_reply());
        assert_eq!(reply.id, 7);
        assert_eq!(reply.payload().unwrap(), Bytes::from_static(b"ok"));

        let seen = vm.wait_for_received(1).await;
        assert_eq!(seen.last().unwrap().id, 7);
    }

    #[tokio::test]
    async fn test_filters_ddms_commands_and_foreign_replies() {
        let (shared, vm) = testing::shared_session(FakeVmConfig::default()).await;
        let proxy = JdwpSessionProxy::start(shared.clone(), ProxyConfig::default())
            .await
            .unwrap();
        let debugger = attach(&proxy).await;

        // A round trip guarantees the proxy is receiving.
        let ping = Packet::command(1, cmdset::VM, cmdset::VM_VERSION, Bytes::new());
        debugger.send_packet(&ping).await.unwrap();
        assert_eq!(receive(&debugger).await.id, 1);

        // Host-internal traffic: a DDMS event and the reply to our own command.
        vm.send_chunk(WaitEvent { reason: 0 }.to_chunk());
        let internal = Packet::command(
            shared.next_packet_id().unwrap(),
            cmdset::VM,
            cmdset::VM_VERSION,
            Bytes::new(),
        );
        let internal_reply = shared.handle_jdwp_command(internal.clone()).await.unwrap();
        assert_eq!(internal_reply.id, internal.id);

        // An ordinary VM event is forwarded unchanged.
        let event = Packet::command(
            99,
            cmdset::EVENT,
            cmdset::EVENT_COMPOSITE,
            Bytes::from_static(b"event"),
        );
        vm.send(event);

        let forwarded = receive(&debugger).await;
        assert!(forwarded.is_command());
        assert_eq!(forwarded.id, 99);
        assert_eq!(forwarded.cmd_set(), Some(cmdset::EVENT));
        assert_eq!(forwarded.payload().unwrap(), Bytes::from_static(b"event"));
    }

    #[tokio::test]
    async fn test_status_follows_attach_and_detach_with_stable_address() {
        let (shared, _vm) = testing::shared_session(FakeVmConfig::default()).await;
        let proxy = JdwpSessionProxy::start(shared, ProxyConfig::default())
            .await
            .unwrap();
        let addr = proxy.local_addr();
        let mut status = proxy.subscribe_status();
        assert!(!proxy.status().is_attached());
        assert_eq!(proxy.status().listen_addr, addr);

        for _ in 0..2 {
            let debugger = attach(&proxy).await;
            let attached = wait_for_status(&mut status, true).await;
            assert_eq!(attached.listen_addr, addr);
            drop(debugger);
            wait_for_status(&mut status, false).await;
        }
        assert_eq!(proxy.local_addr(), addr);
        assert!(proxy.is_running());
    }

    #[tokio::test]
    async fn test_stops_when_shared_session_closes() {
        let (shared, _vm) = testing::shared_session(FakeVmConfig::default()).await;
        let proxy = JdwpSessionProxy::start(shared.clone(), ProxyConfig::default())
            .await
            .unwrap();
        let debugger = attach(&proxy).await;
        let mut status = proxy.subscribe_status();
        wait_for_status(&mut status, true).await;

        shared.close();
        tokio::time::timeout(WAIT, proxy.stopped()).await.unwrap();
        assert!(!proxy.status().is_attached());

        let err = tokio::time::timeout(WAIT, debugger.receive_packet())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_end_of_stream());
    }
}
