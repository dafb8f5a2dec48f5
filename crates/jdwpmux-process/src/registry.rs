use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use jdwpmux_session::{ProxyConfig, SessionConfig, SessionMonitorFactory, SharedSessionConfig};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collector::CollectorConfig;
use crate::device::Device;
use crate::error::{ProcessError, Result};
use crate::handle::ProcessHandle;

/// Configuration for a [`ProcessRegistry`] and the handles it creates.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long the pid feed must stay unchanged before it is applied.
    pub refresh_delay: Duration,
    /// Upper bound on that wait while the feed keeps changing.
    pub max_refresh_delay: Duration,
    pub session: SessionConfig,
    pub shared: SharedSessionConfig,
    pub proxy: ProxyConfig,
    pub collector: CollectorConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_delay: Duration::from_millis(500),
            max_refresh_delay: Duration::from_secs(5),
            session: SessionConfig::default(),
            shared: SharedSessionConfig::default(),
            proxy: ProxyConfig::default(),
            collector: CollectorConfig::default(),
        }
    }
}

/// The debuggable processes of one device, one [`ProcessHandle`] per pid.
///
/// A background task follows the device's pid feed and closes the handles
/// of processes that left it. A delegating registry creates handles that
/// forward to the same pid in another registry.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    device: Device,
    config: Arc<RegistryConfig>,
    factories: Vec<Arc<dyn SessionMonitorFactory>>,
    delegate: Option<ProcessRegistry>,
    scope: CancellationToken,
    processes: Mutex<BTreeMap<u32, ProcessHandle>>,
    reconcile: Arc<Notify>,
}

/// Builds a [`ProcessRegistry`].
pub struct RegistryBuilder {
    device: Device,
    config: RegistryConfig,
    factories: Vec<Arc<dyn SessionMonitorFactory>>,
    delegate: Option<ProcessRegistry>,
}

impl RegistryBuilder {
    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach monitors built by `factory` to every shared session.
    pub fn with_monitor_factory(mut self, factory: Arc<dyn SessionMonitorFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Forward every process lookup to `registry`.
    pub fn delegating_to(mut self, registry: &ProcessRegistry) -> Self {
        self.delegate = Some(registry.clone());
        self
    }

    /// Start the registry. Must be called within a tokio runtime.
    pub fn build(self) -> Result<ProcessRegistry> {
        if self.delegate.as_ref().is_some_and(ProcessRegistry::is_delegating) {
            return Err(ProcessError::NestedDelegation);
        }
        let scope = self.device.scope().child_token();
        let delays = (self.config.refresh_delay, self.config.max_refresh_delay);
        let feed = self.device.process_ids();
        let reconcile = Arc::new(Notify::new());
        let inner = Arc::new(RegistryInner {
            device: self.device,
            config: Arc::new(self.config),
            factories: self.factories,
            delegate: self.delegate,
            scope: scope.clone(),
            processes: Mutex::new(BTreeMap::new()),
            reconcile: reconcile.clone(),
        });
        info!(
            serial = inner.device.serial(),
            delegating = inner.delegate.is_some(),
            "process registry started"
        );
        tokio::spawn(track(Arc::downgrade(&inner), feed, reconcile, scope, delays));
        Ok(ProcessRegistry { inner })
    }
}

impl ProcessRegistry {
    pub fn builder(device: Device) -> RegistryBuilder {
        RegistryBuilder {
            device,
            config: RegistryConfig::default(),
            factories: Vec::new(),
            delegate: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn is_delegating(&self) -> bool {
        self.inner.delegate.is_some()
    }

    /// Cancelled when the registry closes. Every handle scope is a child.
    pub fn scope(&self) -> &CancellationToken {
        &self.inner.scope
    }

    pub fn is_closed(&self) -> bool {
        self.inner.scope.is_cancelled()
    }

    /// The handle for each of `pids`, creating and monitoring missing ones.
    ///
    /// Concurrent callers asking for the same pid get the same handle. A
    /// pid missing from the pid feed is closed at the next refresh.
    pub fn add_processes(
        &self,
        pids: impl IntoIterator<Item = u32>,
    ) -> Result<BTreeMap<u32, ProcessHandle>> {
        let mut processes = self.inner.lock();
        if self.inner.scope.is_cancelled() {
            return Err(self.inner.closed_error());
        }
        let mut added = BTreeMap::new();
        let mut created = false;
        for pid in pids {
            let handle = processes
                .entry(pid)
                .or_insert_with(|| {
                    created = true;
                    self.inner.create_handle(pid)
                })
                .clone();
            handle.start_monitoring();
            added.insert(pid, handle);
        }
        if created {
            self.inner.reconcile.notify_one();
        }
        Ok(added)
    }

    /// Wait until `pid` appears in the device's pid feed, then return its handle.
    pub async fn wait_for_process(&self, pid: u32) -> Result<ProcessHandle> {
        if self.is_delegating() {
            return Err(ProcessError::NestedDelegation);
        }
        let feed = self.inner.device.process_ids();
        let present = tokio::select! {
            biased;
            _ = self.inner.scope.cancelled() => false,
            present = pid_appears(feed, pid) => present,
        };
        if !present {
            return Err(self.inner.closed_error());
        }
        self.add_processes([pid])?
            .remove(&pid)
            .ok_or_else(|| self.inner.closed_error())
    }

    pub fn get(&self, pid: u32) -> Option<ProcessHandle> {
        self.inner.lock().get(&pid).cloned()
    }

    /// Every handle, ordered by pid.
    pub fn processes(&self) -> Vec<ProcessHandle> {
        self.inner.lock().values().cloned().collect()
    }

    /// Close the registry and every handle. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("serial", &self.inner.device.serial())
            .field("processes", &self.inner.lock().keys().collect::<Vec<_>>())
            .field("delegating", &self.is_delegating())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, ProcessHandle>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> ProcessError {
        ProcessError::RegistryClosed {
            serial: self.device.serial().to_string(),
        }
    }

    fn create_handle(&self, pid: u32) -> ProcessHandle {
        let serial = self.device.serial();
        let scope = self.scope.child_token();
        debug!(serial, pid, "adding process");
        match &self.delegate {
            Some(delegate) => ProcessHandle::delegate(pid, serial, scope, delegate.clone()),
            None => ProcessHandle::local(
                pid,
                serial,
                scope,
                self.device.connector().clone(),
                self.config.clone(),
                self.factories.clone(),
            ),
        }
    }

    /// Close the handles of pids missing from `pids`.
    fn set_active(&self, pids: &BTreeSet<u32>) {
        let removed: Vec<ProcessHandle> = {
            let mut processes = self.lock();
            if self.scope.is_cancelled() {
                return;
            }
            let gone: Vec<u32> = processes
                .keys()
                .filter(|pid| !pids.contains(pid))
                .copied()
                .collect();
            gone.iter().filter_map(|pid| processes.remove(pid)).collect()
        };
        for handle in removed {
            info!(serial = self.device.serial(), pid = handle.pid(), "process exited");
            handle.close();
        }
    }

    fn close(&self) {
        let processes = {
            let mut processes = self.lock();
            self.scope.cancel();
            std::mem::take(&mut *processes)
        };
        if !processes.is_empty() {
            debug!(serial = self.device.serial(), count = processes.len(), "closing process handles");
        }
        for handle in processes.into_values() {
            handle.close();
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

async fn pid_appears(mut feed: watch::Receiver<BTreeSet<u32>>, pid: u32) -> bool {
    feed.wait_for(|pids| pids.contains(&pid)).await.is_ok()
}

/// Apply the pid feed to the registry once it has been stable for the
/// refresh delay, or once the feed has kept changing for the maximum delay.
/// New handles also trigger a refresh. Closes the registry when the feed's
/// sender goes away.
async fn track(
    registry: Weak<RegistryInner>,
    mut feed: watch::Receiver<BTreeSet<u32>>,
    reconcile: Arc<Notify>,
    scope: CancellationToken,
    (refresh_delay, max_refresh_delay): (Duration, Duration),
) {
    'feed: loop {
        let deadline = Instant::now() + max_refresh_delay;
        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return,
                changed = feed.changed() => {
                    if changed.is_err() {
                        break 'feed;
                    }
                }
                _ = tokio::time::sleep(refresh_delay) => break,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("pid feed still changing, applying it");
                    break;
                }
            }
        }
        let pids = feed.borrow_and_update().clone();
        match registry.upgrade() {
            Some(inner) => inner.set_active(&pids),
            None => return,
        }
        tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            changed = feed.changed() => {
                if changed.is_err() {
                    break 'feed;
                }
            }
            _ = reconcile.notified() => {}
        }
    }
    if let Some(inner) = registry.upgrade() {
        info!(serial = inner.device.serial(), "device process feed closed");
        inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, FakeConnector};
    use jdwpmux_session::testing::FakeVmConfig;

    const WAIT: Duration = Duration::from_secs(5);

    fn vm(pid: u32) -> FakeVmConfig {
        FakeVmConfig {
            pid,
            wait_after_helo: true,
            ..FakeVmConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_add_processes_is_thread_safe_and_coherent() {
        let connector = Arc::new(FakeConnector::new());
        let (registry, _feed) = test_support::registry(connector, 1..=20);

        let mut tasks = Vec::new();
        for i in 0..50u32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let start = 1 + i % 10;
                registry.add_processes(start..=start + 10).unwrap()
            }));
        }
        let mut seen: BTreeMap<u32, ProcessHandle> = BTreeMap::new();
        for task in tasks {
            let added = task.await.unwrap();
            for (pid, handle) in added {
                assert_eq!(handle.pid(), pid);
                let first = seen.entry(pid).or_insert_with(|| handle.clone());
                assert!(first.ptr_eq(&handle));
            }
        }
        assert_eq!(seen.len(), 20);
        assert_eq!(registry.processes().len(), 20);
        for (pid, handle) in &seen {
            assert!(registry.get(*pid).unwrap().ptr_eq(handle));
        }
        registry.close();
    }

    #[tokio::test]
    async fn test_process_is_closed_when_it_leaves_the_feed() {
        let connector = Arc::new(FakeConnector::new().with_vm(vm(10)));
        let (registry, feed) = test_support::registry(connector, [10, 11]);
        let handles = registry.add_processes([10, 11]).unwrap();

        feed.send_replace(BTreeSet::from([11]));
        tokio::time::timeout(WAIT, handles[&10].scope().cancelled())
            .await
            .unwrap();
        assert!(!handles[&10].is_active());
        assert!(handles[&11].is_active());
        assert!(registry.get(10).is_none());
        assert!(registry.get(11).is_some());
    }

    #[tokio::test]
    async fn test_refresh_delay_coalesces_updates() {
        let connector = Arc::new(FakeConnector::new());
        let config = RegistryConfig {
            refresh_delay: Duration::from_millis(200),
            ..test_support::fast_config()
        };
        let (registry, feed) = test_support::registry_with_config(connector, [10], config);
        let handle = registry.add_processes([10]).unwrap().remove(&10).unwrap();

        for _ in 0..5 {
            feed.send_replace(BTreeSet::new());
            tokio::time::sleep(Duration::from_millis(20)).await;
            feed.send_replace(BTreeSet::from([10]));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(handle.is_active());
        assert!(registry.get(10).unwrap().ptr_eq(&handle));
        registry.close();
    }

    #[tokio::test]
    async fn test_continuous_churn_still_applies_the_feed() {
        let connector = Arc::new(FakeConnector::new());
        let config = RegistryConfig {
            refresh_delay: Duration::from_millis(50),
            max_refresh_delay: Duration::from_millis(200),
            ..test_support::fast_config()
        };
        let (registry, feed) = test_support::registry_with_config(connector, [10], config);
        let handle = registry.add_processes([10]).unwrap().remove(&10).unwrap();

        let churn = tokio::spawn(async move {
            loop {
                feed.send_replace(BTreeSet::new());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        tokio::time::timeout(Duration::from_secs(1), handle.scope().cancelled())
            .await
            .unwrap();
        assert!(registry.get(10).is_none());
        churn.abort();
    }

    #[tokio::test]
    async fn test_added_pid_missing_from_feed_is_closed() {
        let connector = Arc::new(FakeConnector::new());
        let (registry, _feed) = test_support::registry(connector, [10]);
        // Let the initial refresh pass first.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let handles = registry.add_processes([10, 99]).unwrap();
        tokio::time::timeout(WAIT, handles[&99].scope().cancelled())
            .await
            .unwrap();
        assert!(registry.get(99).is_none());
        assert!(handles[&10].is_active());
        registry.close();
    }

    #[tokio::test]
    async fn test_feed_disconnect_closes_registry() {
        let connector = Arc::new(FakeConnector::new());
        let (registry, feed) = test_support::registry(connector, [1]);
        let handle = registry.add_processes([1]).unwrap().remove(&1).unwrap();

        drop(feed);
        tokio::time::timeout(WAIT, registry.scope().cancelled())
            .await
            .unwrap();
        assert!(!handle.is_active());
        assert!(registry.processes().is_empty());
        assert!(matches!(
            registry.add_processes([2]),
            Err(ProcessError::RegistryClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_process() {
        let connector = Arc::new(FakeConnector::new());
        let (registry, feed) = test_support::registry(connector, []);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for_process(20).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        feed.send_replace(BTreeSet::from([20]));
        let handle = tokio::time::timeout(WAIT, waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handle.pid(), 20);
        assert!(registry.get(20).unwrap().ptr_eq(&handle));
        registry.close();
    }

    #[tokio::test]
    async fn test_delegation_converges_on_the_same_session() {
        let connector = Arc::new(FakeConnector::new().with_vm(vm(30)));
        let (primary, _primary_feed) = test_support::registry(connector.clone(), [30]);
        let (delegating, _delegating_feed) =
            test_support::delegating_registry(connector.clone(), [30], &primary);
        assert!(delegating.is_delegating());

        let delegated = delegating.add_processes([30]).unwrap().remove(&30).unwrap();
        assert!(delegated.is_delegate());
        let through_delegate = delegated.shared_session().await.unwrap();

        let local = primary.add_processes([30]).unwrap().remove(&30).unwrap();
        let direct = local.shared_session().await.unwrap();
        assert!(through_delegate.ptr_eq(&direct));
        assert_eq!(connector.opened(), 1);

        // Properties of the delegate follow the primary handle.
        let mut properties = delegated.subscribe_properties();
        let props = tokio::time::timeout(WAIT, properties.wait_for(|props| props.completed))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(props, local.properties());

        let addr = delegated.start_debugger_proxy().await.unwrap();
        assert_eq!(local.start_debugger_proxy().await.unwrap(), addr);
    }

    #[tokio::test]
    async fn test_nested_delegation_is_rejected() {
        let connector = Arc::new(FakeConnector::new());
        let (primary, _feed_a) = test_support::registry(connector.clone(), []);
        let (delegating, _feed_b) =
            test_support::delegating_registry(connector.clone(), [], &primary);

        let (_tx, rx) = watch::channel(BTreeSet::new());
        let device = Device::new("nested", connector, rx);
        let nested = ProcessRegistry::builder(device)
            .delegating_to(&delegating)
            .build();
        assert!(matches!(nested, Err(ProcessError::NestedDelegation)));
        assert!(matches!(
            delegating.wait_for_process(1).await,
            Err(ProcessError::NestedDelegation)
        ));
    }
}
