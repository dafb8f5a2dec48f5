use std::sync::Arc;
use std::time::Duration;

use jdwpmux_frame::FrameError;
use jdwpmux_transport::TransportError;

/// Errors that can occur in session operations.
///
/// Cloneable so that one terminal condition can be handed to every
/// receiver of a shared session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Framing error; the connection cannot be used any more.
    #[error("frame error: {0}")]
    Frame(Arc<FrameError>),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(Arc<TransportError>),

    /// The JDWP handshake was not answered correctly.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The remote side closed the connection.
    #[error("end of stream")]
    EndOfStream,

    /// The session was shut down locally.
    #[error("session shut down")]
    Shutdown,

    /// The shared session was closed.
    #[error("shared session closed")]
    Closed,

    /// The operation was cancelled by its caller or owning scope.
    #[error("cancelled")]
    Cancelled,

    /// The operation is not supported by this session.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A JDWP command was answered with an error code.
    #[error("command {id} failed with JDWP error {error_code}")]
    CommandFailed { id: u32, error_code: u16 },

    /// The VM answered a DDMS command with a FAIL chunk.
    #[error("DDMS command failed ({code}): {message}")]
    DdmsFailed { code: i32, message: String },

    /// A DDMS reply did not have the expected shape.
    #[error("DDMS protocol error: {0}")]
    DdmsProtocol(String),

    /// The receiver did not keep up with the packet stream and was dropped.
    #[error("receiver '{0}' fell behind and was dropped")]
    ReceiverLagged(String),

    /// A background task panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    Framing,
    Io,
    EndOfStream,
    Cancelled,
    Unsupported,
    Timeout,
    Protocol,
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::Frame(_) | Self::HandshakeFailed(_) => SessionErrorKind::Framing,
            Self::Transport(_) | Self::Shutdown | Self::Closed | Self::Internal(_) => {
                SessionErrorKind::Io
            }
            Self::EndOfStream => SessionErrorKind::EndOfStream,
            Self::Cancelled | Self::ReceiverLagged(_) => SessionErrorKind::Cancelled,
            Self::Unsupported(_) => SessionErrorKind::Unsupported,
            Self::Timeout(_) => SessionErrorKind::Timeout,
            Self::CommandFailed { .. } | Self::DdmsFailed { .. } | Self::DdmsProtocol(_) => {
                SessionErrorKind::Protocol
            }
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::ConnectionClosed => Self::EndOfStream,
            FrameError::Timeout(timeout) => Self::Timeout(timeout),
            FrameError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                Self::EndOfStream
            }
            other => Self::Frame(Arc::new(other)),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        Self::Transport(Arc::new(err))
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Internal(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
