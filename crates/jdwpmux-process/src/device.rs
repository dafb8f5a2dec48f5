use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_core::future::BoxFuture;
use jdwpmux_transport::{JdwpStream, TcpEndpoint, TransportError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Device-side operations the process layer depends on.
pub trait DeviceConnector: Send + Sync {
    /// Open a raw JDWP connection to process `pid`. The handshake is not
    /// performed yet.
    fn open_jdwp(&self, pid: u32) -> BoxFuture<'_, Result<JdwpStream, TransportError>>;

    /// The process name as reported by the OS, if it can be read.
    fn read_process_name(&self, pid: u32)
        -> BoxFuture<'_, Result<Option<String>, TransportError>>;
}

/// One device: a connector plus a live feed of debuggable process ids.
///
/// Dropping the feed's sender means the device went away.
#[derive(Clone)]
pub struct Device {
    serial: String,
    connector: Arc<dyn DeviceConnector>,
    process_ids: watch::Receiver<BTreeSet<u32>>,
    scope: CancellationToken,
}

impl Device {
    pub fn new(
        serial: impl Into<String>,
        connector: Arc<dyn DeviceConnector>,
        process_ids: watch::Receiver<BTreeSet<u32>>,
    ) -> Self {
        Self {
            serial: serial.into(),
            connector,
            process_ids,
            scope: CancellationToken::new(),
        }
    }

    /// Tie the device's lifetime to `scope`.
    pub fn with_scope(mut self, scope: CancellationToken) -> Self {
        self.scope = scope;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn connector(&self) -> &Arc<dyn DeviceConnector> {
        &self.connector
    }

    pub fn process_ids(&self) -> watch::Receiver<BTreeSet<u32>> {
        self.process_ids.clone()
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.serial)
            .field("process_ids", &*self.process_ids.borrow())
            .finish()
    }
}

/// Connects every pid to one TCP address, such as a port forwarded to a
/// single process's JDWP endpoint.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl DeviceConnector for TcpConnector {
    fn open_jdwp(&self, _pid: u32) -> BoxFuture<'_, Result<JdwpStream, TransportError>> {
        Box::pin(TcpEndpoint::connect_timeout(self.addr, self.connect_timeout))
    }

    // A forwarded port exposes no OS view of the process.
    fn read_process_name(
        &self,
        _pid: u32,
    ) -> BoxFuture<'_, Result<Option<String>, TransportError>> {
        Box::pin(std::future::ready(Ok(None)))
    }
}
