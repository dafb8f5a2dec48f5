//! Duplex byte-stream transports carrying JDWP connections.
//!
//! Everything above this crate talks to a [`JdwpStream`]: either a TCP
//! connection (a forwarded `jdwp:<pid>` port, or an external debugger
//! attached to a proxy) or an in-memory pipe used by tests and by
//! embedders that already own the device channel.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::JdwpStream;
pub use tcp::TcpEndpoint;
