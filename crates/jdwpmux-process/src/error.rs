use std::time::Duration;

use jdwpmux_session::SessionError;
use jdwpmux_transport::TransportError;
use thiserror::Error;

/// Errors from the process layer.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The registry was closed, or its device disconnected.
    #[error("process registry for device '{serial}' is closed")]
    RegistryClosed { serial: String },

    /// The process handle's scope has ended.
    #[error("process {pid} is closed")]
    ProcessClosed { pid: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("gave up on process {pid} after {attempts} attempts: {last}")]
    RetriesExhausted {
        pid: u32,
        attempts: u32,
        last: String,
    },

    #[error("a delegating registry cannot itself be a delegate")]
    NestedDelegation,
}

impl ProcessError {
    /// Cancellation of the caller or of the owning scope.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::ProcessClosed { .. } => true,
            Self::Session(err) => err.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::Session(err) if err.is_end_of_stream())
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProcessError::Cancelled.is_cancelled());
        assert!(ProcessError::ProcessClosed { pid: 1 }.is_cancelled());
        assert!(ProcessError::from(SessionError::Cancelled).is_cancelled());
        assert!(ProcessError::from(SessionError::EndOfStream).is_end_of_stream());
        assert!(!ProcessError::from(SessionError::Closed).is_end_of_stream());
        assert!(!ProcessError::Timeout(Duration::from_secs(1)).is_cancelled());
    }

    #[test]
    fn test_display() {
        let err = ProcessError::RetriesExhausted {
            pid: 42,
            attempts: 3,
            last: "placeholder name".into(),
        };
        assert_eq!(
            err.to_string(),
            "gave up on process 42 after 3 attempts: placeholder name"
        );
    }
}
