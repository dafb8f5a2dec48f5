use std::fmt;
use std::io;

use jdwpmux_process::ProcessError;
use jdwpmux_session::{SessionError, SessionErrorKind};
use jdwpmux_transport::TransportError;

// Exit code constants follow sysexits.h where one applies.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const USAGE: i32 = 64;
pub const UNAVAILABLE: i32 = 69;
pub const IO_ERROR: i32 = 74;
pub const TIMEOUT: i32 = 124;
pub const INTERRUPTED: i32 = 130;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: &io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::NotFound
        | io::ErrorKind::AddrNotAvailable => UNAVAILABLE,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => IO_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: &TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::ConnectTimeout { .. } => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        TransportError::Shutdown => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

pub fn session_error(context: &str, err: &SessionError) -> CliError {
    if let SessionError::Transport(inner) = err {
        return transport_error(context, inner);
    }
    let code = match err {
        SessionError::HandshakeFailed(_) => UNAVAILABLE,
        _ => match err.kind() {
            SessionErrorKind::Timeout => TIMEOUT,
            SessionErrorKind::Cancelled => INTERRUPTED,
            SessionErrorKind::Io => IO_ERROR,
            SessionErrorKind::Framing
            | SessionErrorKind::EndOfStream
            | SessionErrorKind::Unsupported
            | SessionErrorKind::Protocol => FAILURE,
        },
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn process_error(context: &str, err: ProcessError) -> CliError {
    match err {
        ProcessError::Session(err) => session_error(context, &err),
        ProcessError::Transport(err) => transport_error(context, &err),
        ProcessError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ProcessError::Cancelled | ProcessError::ProcessClosed { .. } => {
            CliError::new(INTERRUPTED, format!("{context}: {err}"))
        }
        ProcessError::RegistryClosed { .. } => {
            CliError::new(UNAVAILABLE, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn refused_connection_is_unavailable() {
        let err = TransportError::Connect {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(transport_error("connect", &err).code, UNAVAILABLE);

        let wrapped = ProcessError::Session(SessionError::Transport(Arc::new(err)));
        let cli = process_error("connect", wrapped);
        assert_eq!(cli.code, UNAVAILABLE);
        assert!(cli.message.starts_with("connect: "));
    }

    #[test]
    fn timeouts_map_to_124() {
        assert_eq!(
            session_error("gc", &SessionError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            process_error("info", ProcessError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
    }

    #[test]
    fn protocol_failures_are_generic_failures() {
        let err = SessionError::DdmsFailed {
            code: 2,
            message: "rejected".into(),
        };
        assert_eq!(session_error("gc", &err).code, FAILURE);
        assert_eq!(session_error("gc", &SessionError::Cancelled).code, INTERRUPTED);
    }
}
