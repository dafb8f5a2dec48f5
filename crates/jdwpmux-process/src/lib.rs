//! Process lifecycle on top of shared JDWP sessions.
//!
//! A [`ProcessRegistry`] owns one [`ProcessHandle`] per debuggable process of
//! a [`Device`] and tears handles down when their process leaves the device's
//! process list. Each handle lazily opens a [`SharedJdwpSession`], collects
//! [`ProcessProperties`] over DDMS and can expose a debugger proxy.
//!
//! [`SharedJdwpSession`]: jdwpmux_session::SharedJdwpSession

mod collector;
pub mod device;
pub mod error;
pub mod handle;
pub mod properties;
pub mod registry;
pub mod resolver;

#[cfg(test)]
mod test_support;

pub use collector::CollectorConfig;
pub use device::{Device, DeviceConnector, TcpConnector};
pub use error::{ProcessError, Result};
pub use handle::ProcessHandle;
pub use properties::{is_placeholder_name, ProcessProperties};
pub use registry::{ProcessRegistry, RegistryBuilder, RegistryConfig};
pub use resolver::{ProcessNameResolver, ResolverConfig};
