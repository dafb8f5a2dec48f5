use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_core::future::BoxFuture;
use jdwpmux_session::testing::{FakeVm, FakeVmConfig};
use jdwpmux_transport::{JdwpStream, TransportError};
use tokio::sync::watch;

use crate::collector::CollectorConfig;
use crate::device::{Device, DeviceConnector};
use crate::registry::{ProcessRegistry, RegistryConfig};

type NameSource = Box<dyn Fn(usize) -> Result<Option<String>, TransportError> + Send + Sync>;

/// Serves fake VMs keyed by pid. Unknown pids refuse the connection.
pub(crate) struct FakeConnector {
    vms: HashMap<u32, FakeVmConfig>,
    running: Mutex<Vec<FakeVm>>,
    opened: AtomicUsize,
    names: NameSource,
    name_reads: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self {
            vms: HashMap::new(),
            running: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            names: Box::new(|_| Ok(None)),
            name_reads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_vm(mut self, config: FakeVmConfig) -> Self {
        self.vms.insert(config.pid, config);
        self
    }

    /// Answer the n-th OS name read (starting at 0) with `names(n)`.
    pub(crate) fn with_names(
        mut self,
        names: impl Fn(usize) -> Result<Option<String>, TransportError> + Send + Sync + 'static,
    ) -> Self {
        self.names = Box::new(names);
        self
    }

    /// Close every VM connection opened so far.
    pub(crate) fn close_vms(&self) {
        for vm in self.running().iter() {
            vm.close();
        }
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn name_reads(&self) -> usize {
        self.name_reads.load(Ordering::SeqCst)
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Vec<FakeVm>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceConnector for FakeConnector {
    fn open_jdwp(&self, pid: u32) -> BoxFuture<'_, Result<JdwpStream, TransportError>> {
        let result = match self.vms.get(&pid) {
            Some(config) => {
                self.opened.fetch_add(1, Ordering::SeqCst);
                let (stream, vm) = FakeVm::pair(config.clone());
                self.running().push(vm);
                Ok(stream)
            }
            None => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no process {pid}"),
            ))),
        };
        Box::pin(std::future::ready(result))
    }

    fn read_process_name(
        &self,
        _pid: u32,
    ) -> BoxFuture<'_, Result<Option<String>, TransportError>> {
        let n = self.name_reads.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::ready((self.names)(n)))
    }
}

pub(crate) fn fast_config() -> RegistryConfig {
    RegistryConfig {
        refresh_delay: Duration::from_millis(50),
        collector: CollectorConfig {
            start_delay: Duration::ZERO,
            properties_timeout: Duration::from_millis(300),
            retry_delay: Duration::from_millis(50),
        },
        ..RegistryConfig::default()
    }
}

/// A registry over `connector` whose feed starts at `pids`.
pub(crate) fn registry(
    connector: Arc<FakeConnector>,
    pids: impl IntoIterator<Item = u32>,
) -> (ProcessRegistry, watch::Sender<BTreeSet<u32>>) {
    registry_with_config(connector, pids, fast_config())
}

pub(crate) fn registry_with_config(
    connector: Arc<FakeConnector>,
    pids: impl IntoIterator<Item = u32>,
    config: RegistryConfig,
) -> (ProcessRegistry, watch::Sender<BTreeSet<u32>>) {
    let (feed, rx) = watch::channel(pids.into_iter().collect());
    let device = Device::new("fake-device", connector, rx);
    let registry = ProcessRegistry::builder(device)
        .with_config(config)
        .build()
        .unwrap();
    (registry, feed)
}

pub(crate) fn delegating_registry(
    connector: Arc<FakeConnector>,
    pids: impl IntoIterator<Item = u32>,
    target: &ProcessRegistry,
) -> (ProcessRegistry, watch::Sender<BTreeSet<u32>>) {
    let (feed, rx) = watch::channel(pids.into_iter().collect());
    let device = Device::new("fake-device-delegating", connector, rx);
    let registry = ProcessRegistry::builder(device)
        .with_config(fast_config())
        .delegating_to(target)
        .build()
        .unwrap();
    (registry, feed)
}
