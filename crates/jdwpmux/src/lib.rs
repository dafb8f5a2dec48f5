//! Share one JDWP connection between many observers and a debugger.
//!
//! jdwpmux multiplexes a single JDWP/DDMS connection to a VM: any number of
//! in-process receivers can watch the packet stream while one external
//! debugger attaches through a local proxy port.
//!
//! # Crate Structure
//!
//! - [`transport`]: Duplex byte streams (TCP, in-memory)
//! - [`frame`]: JDWP packet framing and DDMS chunks
//! - [`session`]: Single-consumer and shared sessions, DDMS commands, debugger proxy
//! - [`process`]: Per-device process registry and name resolution (behind `process` feature)

/// Re-export transport types.
pub mod transport {
    pub use jdwpmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use jdwpmux_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use jdwpmux_session::*;
}

/// Re-export process types (requires `process` feature).
#[cfg(feature = "process")]
pub mod process {
    pub use jdwpmux_process::*;
}
