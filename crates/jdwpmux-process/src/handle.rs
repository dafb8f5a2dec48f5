use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jdwpmux_session::{
    JdwpSession, JdwpSessionProxy, ProxyStatus, SessionMonitorFactory, SharedJdwpSession,
};
use tokio::sync::{watch, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector;
use crate::device::DeviceConnector;
use crate::error::{ProcessError, Result};
use crate::properties::ProcessProperties;
use crate::registry::{ProcessRegistry, RegistryConfig};

/// One debuggable process of a device.
///
/// Cloning is cheap; clones share the same state. The handle is valid until
/// its [`scope`](ProcessHandle::scope) is cancelled, which the owning
/// registry does when the process exits.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    pid: u32,
    serial: String,
    scope: CancellationToken,
    properties: watch::Sender<ProcessProperties>,
    monitoring: AtomicBool,
    kind: HandleKind,
}

enum HandleKind {
    Local(LocalProcess),
    Delegate(DelegateProcess),
}

/// Owns the connection to the process.
struct LocalProcess {
    connector: Arc<dyn DeviceConnector>,
    config: Arc<RegistryConfig>,
    factories: Vec<Arc<dyn SessionMonitorFactory>>,
    session: Mutex<Option<SharedJdwpSession>>,
    proxy: Mutex<ProxySlot>,
}

#[derive(Default)]
struct ProxySlot {
    proxy: Option<JdwpSessionProxy>,
    last_addr: Option<SocketAddr>,
}

/// Forwards to the handle for the same pid in another registry.
struct DelegateProcess {
    registry: ProcessRegistry,
    target: OnceCell<ProcessHandle>,
}

impl ProcessHandle {
    pub(crate) fn local(
        pid: u32,
        serial: &str,
        scope: CancellationToken,
        connector: Arc<dyn DeviceConnector>,
        config: Arc<RegistryConfig>,
        factories: Vec<Arc<dyn SessionMonitorFactory>>,
    ) -> Self {
        Self::new(
            pid,
            serial,
            scope,
            HandleKind::Local(LocalProcess {
                connector,
                config,
                factories,
                session: Mutex::new(None),
                proxy: Mutex::new(ProxySlot::default()),
            }),
        )
    }

    pub(crate) fn delegate(
        pid: u32,
        serial: &str,
        scope: CancellationToken,
        registry: ProcessRegistry,
    ) -> Self {
        Self::new(
            pid,
            serial,
            scope,
            HandleKind::Delegate(DelegateProcess {
                registry,
                target: OnceCell::new(),
            }),
        )
    }

    fn new(pid: u32, serial: &str, scope: CancellationToken, kind: HandleKind) -> Self {
        let (properties, _) = watch::channel(ProcessProperties::new(pid));
        Self {
            inner: Arc::new(HandleInner {
                pid,
                serial: serial.to_string(),
                scope,
                properties,
                monitoring: AtomicBool::new(false),
                kind,
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn serial(&self) -> &str {
        &self.inner.serial
    }

    /// Cancelled when the process exits or the handle is closed.
    pub fn scope(&self) -> &CancellationToken {
        &self.inner.scope
    }

    pub fn is_active(&self) -> bool {
        !self.inner.scope.is_cancelled()
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self.inner.kind, HandleKind::Delegate(_))
    }

    pub fn properties(&self) -> ProcessProperties {
        self.inner.properties.borrow().clone()
    }

    pub fn subscribe_properties(&self) -> watch::Receiver<ProcessProperties> {
        self.inner.properties.subscribe()
    }

    pub(crate) fn update_properties(&self, update: impl FnOnce(&mut ProcessProperties)) {
        self.inner.properties.send_modify(update);
    }

    /// The process's shared session, connecting on first use and again
    /// after the previous session ended.
    pub async fn shared_session(&self) -> Result<SharedJdwpSession> {
        match &self.inner.kind {
            HandleKind::Local(local) => self.open_shared(local).await,
            HandleKind::Delegate(delegate) => self.delegate_target(delegate).await?.local_shared().await,
        }
    }

    /// Start a debugger proxy for this process, or return the running one.
    ///
    /// A restarted proxy tries to keep its previous address.
    pub async fn start_debugger_proxy(&self) -> Result<SocketAddr> {
        match &self.inner.kind {
            HandleKind::Local(local) => self.open_proxy(local).await,
            HandleKind::Delegate(delegate) => self.delegate_target(delegate).await?.local_proxy().await,
        }
    }

    /// Start collecting properties. Later calls do nothing.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_monitoring(&self) {
        if self.inner.monitoring.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self.clone();
        match &self.inner.kind {
            HandleKind::Local(local) => {
                let config = local.config.collector.clone();
                tokio::spawn(collector::run(handle, config));
            }
            HandleKind::Delegate(_) => {
                tokio::spawn(mirror_delegate(handle));
            }
        }
    }

    /// Cancel the scope, closing the session and proxy.
    pub fn close(&self) {
        if !self.inner.scope.is_cancelled() {
            debug!(pid = self.inner.pid, serial = %self.inner.serial, "closing process handle");
        }
        self.inner.scope.cancel();
    }

    /// Whether two handles refer to the same process state.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_active(&self) -> Result<()> {
        if self.inner.scope.is_cancelled() {
            return Err(ProcessError::ProcessClosed {
                pid: self.inner.pid,
            });
        }
        Ok(())
    }

    async fn local_shared(&self) -> Result<SharedJdwpSession> {
        match &self.inner.kind {
            HandleKind::Local(local) => self.open_shared(local).await,
            HandleKind::Delegate(_) => Err(ProcessError::NestedDelegation),
        }
    }

    async fn local_proxy(&self) -> Result<SocketAddr> {
        match &self.inner.kind {
            HandleKind::Local(local) => self.open_proxy(local).await,
            HandleKind::Delegate(_) => Err(ProcessError::NestedDelegation),
        }
    }

    async fn delegate_target(&self, delegate: &DelegateProcess) -> Result<ProcessHandle> {
        self.check_active()?;
        let pid = self.inner.pid;
        let target = delegate
            .target
            .get_or_try_init(|| async {
                debug!(pid, "waiting for delegate process");
                tokio::select! {
                    biased;
                    _ = self.inner.scope.cancelled() => Err(ProcessError::ProcessClosed { pid }),
                    handle = delegate.registry.wait_for_process(pid) => handle,
                }
            })
            .await?;
        Ok(target.clone())
    }

    async fn open_shared(&self, local: &LocalProcess) -> Result<SharedJdwpSession> {
        let mut slot = local.session.lock().await;
        if let Some(shared) = slot.as_ref() {
            if !shared.is_terminated() && !shared.is_closed() {
                return Ok(shared.clone());
            }
            debug!(pid = self.inner.pid, "previous shared session ended, reconnecting");
        }
        self.check_active()?;

        let pid = self.inner.pid;
        let connect = async {
            let stream = local.connector.open_jdwp(pid).await?;
            let session = JdwpSession::connect(stream, local.config.session.clone()).await?;
            Ok::<_, ProcessError>(session)
        };
        let session = tokio::select! {
            biased;
            _ = self.inner.scope.cancelled() => return Err(ProcessError::ProcessClosed { pid }),
            session = connect => session?,
        };
        let shared = SharedJdwpSession::builder(session)
            .with_config(local.config.shared.clone())
            .with_pid(pid)
            .with_monitor_factories(&local.factories)
            .with_parent_cancellation(&self.inner.scope)
            .build();
        info!(pid, serial = %self.inner.serial, "opened shared jdwp session");
        *slot = Some(shared.clone());
        Ok(shared)
    }

    async fn open_proxy(&self, local: &LocalProcess) -> Result<SocketAddr> {
        let mut slot = local.proxy.lock().await;
        if let Some(proxy) = slot.proxy.as_ref().filter(|proxy| proxy.is_running()) {
            return Ok(proxy.local_addr());
        }
        let shared = self.open_shared(local).await?;

        let mut config = local.config.proxy.clone();
        let proxy = match slot.last_addr {
            Some(addr) => {
                config.bind_addr = addr;
                match JdwpSessionProxy::start(shared.clone(), config).await {
                    Ok(proxy) => proxy,
                    Err(err) => {
                        warn!(pid = self.inner.pid, %addr, error = %err, "could not reuse proxy address");
                        JdwpSessionProxy::start(shared, local.config.proxy.clone()).await?
                    }
                }
            }
            None => JdwpSessionProxy::start(shared, config).await?,
        };
        let addr = proxy.local_addr();
        tokio::spawn(mirror_proxy_status(self.clone(), proxy.subscribe_status()));
        slot.last_addr = Some(addr);
        slot.proxy = Some(proxy);
        Ok(addr)
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("serial", &self.inner.serial)
            .field("active", &self.is_active())
            .field("delegate", &self.is_delegate())
            .finish()
    }
}

async fn mirror_proxy_status(handle: ProcessHandle, mut status: watch::Receiver<ProxyStatus>) {
    loop {
        let current = status.borrow_and_update().clone();
        handle.update_properties(|props| props.proxy_status = Some(current));
        tokio::select! {
            biased;
            _ = handle.scope().cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    handle.update_properties(|props| {
        if let Some(status) = props.proxy_status.as_mut() {
            status.external_debugger = None;
        }
    });
}

/// Keep a delegating handle's properties equal to its target's.
async fn mirror_delegate(handle: ProcessHandle) {
    let HandleKind::Delegate(delegate) = &handle.inner.kind else {
        return;
    };
    let target = match handle.delegate_target(delegate).await {
        Ok(target) => target,
        Err(err) => {
            debug!(pid = handle.pid(), error = %err, "delegate process unavailable");
            return;
        }
    };
    target.start_monitoring();
    let mut properties = target.subscribe_properties();
    loop {
        let current = properties.borrow_and_update().clone();
        handle.inner.properties.send_replace(current);
        tokio::select! {
            biased;
            _ = handle.scope().cancelled() => return,
            _ = target.scope().cancelled() => return,
            changed = properties.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
