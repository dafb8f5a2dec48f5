//! Shared JDWP sessions.
//!
//! A [`JdwpSession`] owns one connection and allows a single consumer. A
//! [`SharedJdwpSession`] sits on top of it and lets any number of
//! receivers observe the packet stream concurrently, each in order and
//! each primed with the session's replay packets. [`JdwpSessionProxy`]
//! exposes a shared session to one external debugger at a time.

pub mod error;
pub mod filter;
pub mod handshake;
pub mod monitor;
pub mod protocol;
pub mod proxy;
pub mod receiver;
pub mod session;
pub mod shared;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Result, SessionError, SessionErrorKind};
pub use filter::{FilterId, NoDdmsFilter, NoDdmsFilterFactory, PacketFilter, PacketFilterFactory};
pub use handshake::{handshake_client, handshake_server, HANDSHAKE};
pub use monitor::{MonitorContext, SessionMonitor, SessionMonitorFactory};
pub use protocol::{DdmsProtocolKind, JdwpCommandProgress, NoProgress};
pub use proxy::{JdwpSessionProxy, ProxyConfig, ProxyStatus};
pub use receiver::PacketReceiver;
pub use session::{JdwpSession, SessionConfig};
pub use shared::{SharedJdwpSession, SharedSessionBuilder, SharedSessionConfig};
