use std::net::SocketAddr;

use jdwpmux_frame::Packet;

/// Observes every packet transiting one shared session.
///
/// Callbacks run synchronously on the sending task or the pump, so they
/// must not block.
pub trait SessionMonitor: Send + Sync {
    fn on_send(&self, _packet: &Packet) {}
    fn on_receive(&self, _packet: &Packet) {}
    /// Called exactly once, when the shared session closes.
    fn on_close(&self) {}
}

/// What a factory knows about the session it is creating a monitor for.
#[derive(Debug, Clone, Default)]
pub struct MonitorContext {
    pub pid: Option<u32>,
    pub peer: Option<SocketAddr>,
}

/// Creates one monitor per shared session. Returning `None` skips the session.
pub trait SessionMonitorFactory: Send + Sync {
    fn create(&self, context: &MonitorContext) -> Option<Box<dyn SessionMonitor>>;
}

pub(crate) struct MonitorSet {
    monitors: Vec<Box<dyn SessionMonitor>>,
}

impl MonitorSet {
    pub(crate) fn new(monitors: Vec<Box<dyn SessionMonitor>>) -> Self {
        Self { monitors }
    }

    pub(crate) fn on_send(&self, packet: &Packet) {
        for monitor in &self.monitors {
            monitor.on_send(packet);
        }
    }

    pub(crate) fn on_receive(&self, packet: &Packet) {
        for monitor in &self.monitors {
            monitor.on_receive(packet);
        }
    }

    pub(crate) fn on_close(&self) {
        for monitor in &self.monitors {
            monitor.on_close();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.monitors.len()
    }
}
