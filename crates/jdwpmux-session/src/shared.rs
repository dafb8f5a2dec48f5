use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use jdwpmux_frame::Packet;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SessionError};
use crate::filter::{FilterId, FilterSet, PacketFilterFactory};
use crate::monitor::{MonitorContext, MonitorSet, SessionMonitorFactory};
use crate::protocol::DdmsProtocolKind;
use crate::receiver::PacketReceiver;
use crate::session::JdwpSession;

/// Default number of packets queued per receiver before it is dropped.
pub const DEFAULT_RECEIVER_QUEUE_CAPACITY: usize = 1024;

/// Configuration for a [`SharedJdwpSession`].
#[derive(Debug, Clone)]
pub struct SharedSessionConfig {
    /// Packets buffered for one receiver. A receiver that falls further
    /// behind is terminated with [`SessionError::ReceiverLagged`].
    pub receiver_queue_capacity: usize,
    /// Whether the VM answers empty-reply DDMS commands at all.
    pub ddms_protocol_kind: DdmsProtocolKind,
    /// How long to wait for a possibly-absent DDMS reply after sending.
    pub ddms_reply_timeout: Duration,
    /// Bound on commands that must be answered. `None` waits forever.
    pub command_timeout: Option<Duration>,
}

impl Default for SharedSessionConfig {
    fn default() -> Self {
        Self {
            receiver_queue_capacity: DEFAULT_RECEIVER_QUEUE_CAPACITY,
            ddms_protocol_kind: DdmsProtocolKind::EmptyRepliesDiscarded,
            ddms_reply_timeout: Duration::from_secs(2),
            command_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// A [`JdwpSession`] shared by any number of concurrent receivers.
///
/// Cloning is cheap and every clone refers to the same session. One
/// background pump, started when the first receiver activates, reads the
/// session and hands each packet to every active receiver's queue.
#[derive(Clone)]
pub struct SharedJdwpSession {
    pub(crate) inner: Arc<SharedInner>,
}

pub(crate) struct SharedInner {
    pub(crate) session: JdwpSession,
    pub(crate) config: SharedSessionConfig,
    pub(crate) pid: Option<u32>,
    state: Mutex<SharedState>,
    receiver_count: watch::Sender<usize>,
    next_receiver_id: AtomicU64,
    pump_started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    ended: CancellationToken,
    monitors: MonitorSet,
    filters: FilterSet,
}

#[derive(Default)]
struct SharedState {
    replay: Vec<Packet>,
    receivers: BTreeMap<u64, ReceiverSlot>,
    terminal: Option<SessionError>,
}

struct ReceiverSlot {
    name: String,
    filter: Option<FilterId>,
    tx: mpsc::Sender<Packet>,
    lagged: Arc<AtomicBool>,
}

/// Builds a [`SharedJdwpSession`].
pub struct SharedSessionBuilder {
    session: JdwpSession,
    config: SharedSessionConfig,
    pid: Option<u32>,
    factories: Vec<Arc<dyn SessionMonitorFactory>>,
    filter_factories: Vec<Arc<dyn PacketFilterFactory>>,
    parent: Option<CancellationToken>,
}

impl SharedSessionBuilder {
    pub fn with_config(mut self, config: SharedSessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Process id, used in logs and handed to monitor factories.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_monitor_factories(mut self, factories: &[Arc<dyn SessionMonitorFactory>]) -> Self {
        self.factories.extend(factories.iter().cloned());
        self
    }

    /// Register filters receivers can select with
    /// [`PacketReceiver::with_filter`]. [`FilterId::NO_DDMS`] is always present.
    pub fn with_filter_factories(mut self, factories: &[Arc<dyn PacketFilterFactory>]) -> Self {
        self.filter_factories.extend(factories.iter().cloned());
        self
    }

    /// Close the shared session when `token` is cancelled.
    pub fn with_parent_cancellation(mut self, token: &CancellationToken) -> Self {
        self.parent = Some(token.clone());
        self
    }

    /// Must be called within a tokio runtime when a parent token is set.
    pub fn build(self) -> SharedJdwpSession {
        let context = MonitorContext {
            pid: self.pid,
            peer: self.session.peer_addr(),
        };
        let monitors = self
            .factories
            .iter()
            .filter_map(|factory| factory.create(&context))
            .collect();
        let filters = FilterSet::new(&self.filter_factories, &context);
        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (receiver_count, _) = watch::channel(0);
        let inner = Arc::new(SharedInner {
            session: self.session,
            config: self.config,
            pid: self.pid,
            state: Mutex::new(SharedState::default()),
            receiver_count,
            next_receiver_id: AtomicU64::new(1),
            pump_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel,
            ended: CancellationToken::new(),
            monitors: MonitorSet::new(monitors),
            filters,
        });
        if self.parent.is_some() {
            let weak = Arc::downgrade(&inner);
            let token = inner.cancel.clone();
            tokio::spawn(close_on_cancel(weak, token));
        }
        debug!(pid = ?inner.pid, monitors = inner.monitors.len(), "shared jdwp session created");
        SharedJdwpSession { inner }
    }
}

async fn close_on_cancel(weak: Weak<SharedInner>, token: CancellationToken) {
    token.cancelled().await;
    if let Some(inner) = weak.upgrade() {
        inner.close();
    }
}

impl SharedJdwpSession {
    /// Share `session` with default configuration and no monitors.
    pub fn new(session: JdwpSession) -> Self {
        Self::builder(session).build()
    }

    pub fn builder(session: JdwpSession) -> SharedSessionBuilder {
        SharedSessionBuilder {
            session,
            config: SharedSessionConfig::default(),
            pid: None,
            factories: Vec::new(),
            filter_factories: Vec::new(),
            parent: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn config(&self) -> &SharedSessionConfig {
        &self.inner.config
    }

    /// See [`JdwpSession::next_packet_id`].
    pub fn next_packet_id(&self) -> Result<u32> {
        self.inner.check_open()?;
        self.inner.session.next_packet_id()
    }

    /// Send one packet.
    ///
    /// The write runs on its own task, so dropping this future never leaves
    /// a partial packet on the wire.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.inner.check_open()?;
        let packet = packet.detach()?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.monitors.on_send(&packet);
            inner.filters.before_send(&packet);
            inner.session.send_packet(&packet).await
        })
        .await?
    }

    /// Keep a copy of `packet` to deliver to every receiver before live packets.
    pub fn add_replay_packet(&self, packet: &Packet) -> Result<()> {
        self.inner.check_open()?;
        let packet = packet.detach()?;
        trace!(pid = ?self.inner.pid, %packet, "adding replay packet");
        self.inner.lock_state().replay.push(packet);
        Ok(())
    }

    pub fn replay_packet_count(&self) -> usize {
        self.inner.lock_state().replay.len()
    }

    /// A new receiver. Nothing happens until [`PacketReceiver::receive`] is called.
    pub fn new_packet_receiver(&self) -> Result<PacketReceiver> {
        self.inner.check_open()?;
        Ok(PacketReceiver::new(self.clone()))
    }

    /// Number of receivers currently registered with the pump.
    pub fn active_receiver_count(&self) -> usize {
        *self.inner.receiver_count.borrow()
    }

    /// The condition that ended the session, if it has ended.
    pub fn terminal_error(&self) -> Option<SessionError> {
        self.inner.lock_state().terminal.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock_state().terminal.is_some()
    }

    /// Resolves once the session has reached its terminal condition.
    pub async fn terminated(&self) {
        self.inner.ended.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the pump, shut the session and terminate every receiver. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether two handles refer to the same shared session.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedJdwpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedJdwpSession")
            .field("pid", &self.inner.pid)
            .field("receivers", &self.active_receiver_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A receiver's place in the fan-out table. Dropping it deregisters.
pub(crate) struct Registration {
    inner: Arc<SharedInner>,
    id: u64,
    name: String,
    lagged: Arc<AtomicBool>,
    pub(crate) rx: mpsc::Receiver<Packet>,
}

impl Registration {
    /// Why the queue closed.
    pub(crate) fn termination(&self) -> SessionError {
        if self.lagged.load(Ordering::Acquire) {
            return SessionError::ReceiverLagged(self.name.clone());
        }
        self.inner
            .lock_state()
            .terminal
            .clone()
            .unwrap_or(SessionError::Closed)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.deregister(self.id);
    }
}

/// What a receiver sees when it joins.
pub(crate) enum Joined {
    Live {
        registration: Registration,
        replay: Vec<Packet>,
    },
    Ended {
        replay: Vec<Packet>,
        terminal: SessionError,
    },
}

impl SharedInner {
    fn lock_state(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Register a receiver, atomically with the replay snapshot.
    pub(crate) fn register(self: &Arc<Self>, name: &str, filter: Option<FilterId>) -> Result<Joined> {
        self.check_open()?;
        if let Some(id) = filter {
            if !self.filters.contains(id) {
                return Err(SessionError::Unsupported("no packet filter registered under this id"));
            }
        }
        let mut state = self.lock_state();
        let replay: Vec<Packet> = state
            .replay
            .iter()
            .filter(|packet| filter.is_none_or(|id| self.filters.accepts(id, packet)))
            .cloned()
            .collect();
        if let Some(terminal) = state.terminal.clone() {
            return Ok(Joined::Ended { replay, terminal });
        }
        let id = self.next_receiver_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.receiver_queue_capacity.max(1));
        let lagged = Arc::new(AtomicBool::new(false));
        state.receivers.insert(
            id,
            ReceiverSlot {
                name: name.to_string(),
                filter,
                tx,
                lagged: lagged.clone(),
            },
        );
        self.receiver_count.send_replace(state.receivers.len());
        drop(state);
        debug!(pid = ?self.pid, receiver = name, id, "receiver registered");
        Ok(Joined::Live {
            registration: Registration {
                inner: self.clone(),
                id,
                name: name.to_string(),
                lagged,
                rx,
            },
            replay,
        })
    }

    fn deregister(&self, id: u64) {
        let mut state = self.lock_state();
        if let Some(slot) = state.receivers.remove(&id) {
            trace!(pid = ?self.pid, receiver = %slot.name, id, "receiver deregistered");
        }
        self.receiver_count.send_replace(state.receivers.len());
    }

    /// Start the pump if it is not running yet.
    pub(crate) fn start_pump(self: &Arc<Self>) {
        if self.pump_started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(run_pump(
            Arc::downgrade(self),
            self.receiver_count.subscribe(),
            self.cancel.clone(),
        ));
    }

    fn dispatch(&self, packet: &Packet) {
        let rejecting = self.filters.rejecting(packet);
        let mut state = self.lock_state();
        let mut lagging = Vec::new();
        for (id, slot) in &state.receivers {
            if slot.filter.is_some_and(|filter| rejecting.contains(&filter)) {
                trace!(pid = ?self.pid, receiver = %slot.name, %packet, "packet filtered");
                continue;
            }
            match slot.tx.try_send(packet.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(pid = ?self.pid, receiver = %slot.name, "receiver queue full, dropping receiver");
                    slot.lagged.store(true, Ordering::Release);
                    lagging.push(*id);
                }
                // Receiver is going away; its registration removes the slot.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        for id in lagging {
            state.receivers.remove(&id);
        }
        self.receiver_count.send_replace(state.receivers.len());
    }

    /// Record the terminal condition and release every receiver queue.
    fn terminate(&self, terminal: SessionError) {
        let mut state = self.lock_state();
        if state.terminal.is_none() {
            state.terminal = Some(terminal);
        }
        state.receivers.clear();
        self.receiver_count.send_replace(0);
        drop(state);
        self.ended.cancel();
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pid = ?self.pid, "closing shared jdwp session");
        self.cancel.cancel();
        self.session.shutdown();
        self.terminate(SessionError::Closed);
        self.monitors.on_close();
    }
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        // Wakes a pending close_on_cancel task so it can exit.
        self.cancel.cancel();
        if !self.closed.load(Ordering::Acquire) {
            self.session.shutdown();
            self.monitors.on_close();
        }
    }
}

// Holds the session strongly only while some receiver is registered, so the
// last dropped handle still shuts the session down.
async fn run_pump(
    weak: Weak<SharedInner>,
    mut count: watch::Receiver<usize>,
    cancel: CancellationToken,
) {
    trace!("pump started");
    let terminal = loop {
        let has_receivers = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            present = wait_for_receivers(&mut count) => present,
        };
        if !has_receivers {
            break SessionError::Closed;
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break SessionError::Closed,
            // Reads are cancel-safe; unread bytes stay buffered.
            _ = wait_for_idle(&mut count) => continue,
            received = inner.session.receive_packet() => received,
        };
        let packet = match received.and_then(|p| p.detach().map_err(SessionError::from)) {
            Ok(packet) => packet,
            Err(err) => break err,
        };
        inner.monitors.on_receive(&packet);
        inner.dispatch(&packet);
        inner.filters.after_receive(&packet);
    };
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if terminal.is_end_of_stream() {
        debug!(pid = ?inner.pid, "pump reached end of stream");
    } else {
        debug!(pid = ?inner.pid, error = %terminal, "pump stopped");
    }
    inner.terminate(terminal);
}

// Packets stay in the socket while nobody is listening.
async fn wait_for_receivers(count: &mut watch::Receiver<usize>) -> bool {
    count.wait_for(|n| *n > 0).await.is_ok()
}

async fn wait_for_idle(count: &mut watch::Receiver<usize>) {
    if count.wait_for(|n| *n == 0).await.is_err() {
        std::future::pending::<()>().await;
    }
}
