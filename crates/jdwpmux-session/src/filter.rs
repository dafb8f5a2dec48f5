//! Per-receiver packet filters.
//!
//! A filter is created once per shared session and sees every packet sent
//! and received on it. Receivers opt in with [`PacketReceiver::with_filter`]
//! and then only see packets the filter accepts.
//!
//! [`PacketReceiver::with_filter`]: crate::PacketReceiver::with_filter

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use jdwpmux_frame::Packet;

use crate::monitor::MonitorContext;

/// Names a filter registered on a shared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(pub &'static str);

impl FilterId {
    /// Hides DDMS traffic. Installed on every shared session.
    pub const NO_DDMS: FilterId = FilterId("no-ddms");
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Decides which packets the receivers using it see.
///
/// Hooks run synchronously on the sending task or the pump.
pub trait PacketFilter: Send + Sync {
    fn id(&self) -> FilterId;

    fn before_send(&self, _packet: &Packet) {}

    /// Whether receivers using this filter get `packet`. Called before
    /// [`PacketFilter::after_receive`] for the same packet.
    fn accepts(&self, packet: &Packet) -> bool;

    fn after_receive(&self, _packet: &Packet) {}
}

/// Creates one filter per shared session. Returning `None` skips the session.
pub trait PacketFilterFactory: Send + Sync {
    fn create(&self, context: &MonitorContext) -> Option<Box<dyn PacketFilter>>;
}

/// Hides DDMS commands and the replies to DDMS commands sent on the session.
#[derive(Default)]
pub struct NoDdmsFilter {
    pending: Mutex<HashSet<u32>>,
}

impl NoDdmsFilter {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PacketFilter for NoDdmsFilter {
    fn id(&self) -> FilterId {
        FilterId::NO_DDMS
    }

    fn before_send(&self, packet: &Packet) {
        if packet.is_ddms_command() {
            self.pending().insert(packet.id);
        }
    }

    fn accepts(&self, packet: &Packet) -> bool {
        if packet.is_reply() {
            return !self.pending().contains(&packet.id);
        }
        !packet.is_ddms_command()
    }

    fn after_receive(&self, packet: &Packet) {
        if packet.is_reply() {
            self.pending().remove(&packet.id);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoDdmsFilterFactory;

impl PacketFilterFactory for NoDdmsFilterFactory {
    fn create(&self, _context: &MonitorContext) -> Option<Box<dyn PacketFilter>> {
        Some(Box::new(NoDdmsFilter::default()))
    }
}

pub(crate) struct FilterSet {
    filters: Vec<Box<dyn PacketFilter>>,
}

impl FilterSet {
    /// `NO_DDMS` plus whatever `factories` create. A later filter with an
    /// id already taken is ignored.
    pub(crate) fn new(factories: &[Arc<dyn PacketFilterFactory>], context: &MonitorContext) -> Self {
        let mut filters: Vec<Box<dyn PacketFilter>> = vec![Box::new(NoDdmsFilter::default())];
        for filter in factories.iter().filter_map(|factory| factory.create(context)) {
            if filters.iter().any(|existing| existing.id() == filter.id()) {
                tracing::warn!(filter = %filter.id(), "duplicate packet filter ignored");
                continue;
            }
            filters.push(filter);
        }
        Self { filters }
    }

    pub(crate) fn contains(&self, id: FilterId) -> bool {
        self.filters.iter().any(|filter| filter.id() == id)
    }

    pub(crate) fn before_send(&self, packet: &Packet) {
        for filter in &self.filters {
            filter.before_send(packet);
        }
    }

    pub(crate) fn accepts(&self, id: FilterId, packet: &Packet) -> bool {
        self.filters
            .iter()
            .find(|filter| filter.id() == id)
            .is_none_or(|filter| filter.accepts(packet))
    }

    /// Ids of the filters that reject `packet`.
    pub(crate) fn rejecting(&self, packet: &Packet) -> Vec<FilterId> {
        self.filters
            .iter()
            .filter(|filter| !filter.accepts(packet))
            .map(|filter| filter.id())
            .collect()
    }

    pub(crate) fn after_receive(&self, packet: &Packet) {
        for filter in &self.filters {
            filter.after_receive(packet);
        }
    }
}
