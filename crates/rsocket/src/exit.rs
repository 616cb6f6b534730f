use std::fmt;
use std::io;

use rsocket_core::{RSocketError, StreamError};
use rsocket_frame::FrameError;
use rsocket_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

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

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint(_) | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::FrameTooLarge { .. } | FrameError::Malformed { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn stream_error(context: &str, err: StreamError) -> CliError {
    match err {
        StreamError::Invalid(_) | StreamError::Protocol(_) | StreamError::FlowControl(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn rsocket_error(context: &str, err: RSocketError) -> CliError {
    match err {
        RSocketError::Transport(err) => transport_error(context, err),
        RSocketError::Frame(err) => frame_error(context, err),
        RSocketError::Io(err) => io_error(context, err),
        RSocketError::Stream(err) => stream_error(context, err),
        RSocketError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        RSocketError::Disconnected
        | RSocketError::Closed
        | RSocketError::SetupRejected { .. }
        | RSocketError::HandshakeFailed(_)
        | RSocketError::ResumeFailed(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_is_a_transport_error() {
        let err = transport_error(
            "connect failed",
            TransportError::Connect {
                endpoint: "/tmp/missing.sock".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn stream_errors_split_protocol_faults_from_failures() {
        assert_eq!(
            stream_error("request", StreamError::FlowControl("too many".to_string())).code,
            DATA_INVALID
        );
        assert_eq!(
            stream_error("request", StreamError::Rejected("no".to_string())).code,
            FAILURE
        );
    }

    #[test]
    fn engine_timeout_maps_to_timeout_code() {
        let err = rsocket_error("request", RSocketError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(err.code, TIMEOUT);
    }
}
