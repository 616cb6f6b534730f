use std::fmt;
use std::time::Duration;

use rsocket_frame::{ErrorCode, ErrorFrame, FrameError, Payload, ProtocolVersion, StreamId};
use rsocket_transport::TransportError;

/// How a stream was terminated when it did not finish on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamCompletionSignal {
    Complete,
    Cancel,
    Error,
    ApplicationError,
    InvalidSetup,
    UnsupportedSetup,
    RejectedSetup,
    ConnectionError,
    ConnectionEnd,
    SocketClosed,
}

impl StreamCompletionSignal {
    /// Signal used when closing a connection because of an ERROR frame.
    ///
    /// Setup codes keep their own signal; every other code is a generic error.
    pub fn from_error_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidSetup => Self::InvalidSetup,
            ErrorCode::UnsupportedSetup => Self::UnsupportedSetup,
            ErrorCode::RejectedSetup => Self::RejectedSetup,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for StreamCompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Complete => "complete",
            Self::Cancel => "cancel",
            Self::Error => "error",
            Self::ApplicationError => "application error",
            Self::InvalidSetup => "invalid setup",
            Self::UnsupportedSetup => "unsupported setup",
            Self::RejectedSetup => "rejected setup",
            Self::ConnectionError => "connection error",
            Self::ConnectionEnd => "connection end",
            Self::SocketClosed => "socket closed",
        };
        f.write_str(name)
    }
}

/// Error delivered to the consumer of one stream.
///
/// Never affects other streams or the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The responder failed with an application payload.
    #[error("application error: {}", .0.data_utf8_lossy())]
    Application(Payload),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("request canceled: {0}")]
    Canceled(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// The producer sent more items than were requested.
    #[error("flow control violation: {0}")]
    FlowControl(String),

    /// The peer broke the interaction's frame sequence.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An ERROR frame with a code that has no dedicated variant.
    #[error("stream error {code}: {message}")]
    Other { code: ErrorCode, message: String },

    /// The connection was disconnected or closed when the request was made.
    #[error("connection is disconnected or closed")]
    Unavailable,

    /// The connection ended the stream before it completed.
    #[error("stream interrupted: {0}")]
    Interrupted(StreamCompletionSignal),
}

impl StreamError {
    /// Application error with a text message.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(Payload::new(message.into()))
    }

    /// Translate an ERROR frame received for a stream.
    pub fn from_error_frame(frame: &ErrorFrame) -> Self {
        match frame.code {
            ErrorCode::ApplicationError => Self::Application(frame.payload.clone()),
            ErrorCode::Rejected => Self::Rejected(frame.message()),
            ErrorCode::Canceled => Self::Canceled(frame.message()),
            ErrorCode::Invalid => Self::Invalid(frame.message()),
            code => Self::Other {
                code,
                message: frame.message(),
            },
        }
    }

    /// ERROR frame a responder sends for this failure.
    pub fn to_error_frame(&self, stream_id: StreamId) -> ErrorFrame {
        match self {
            Self::Application(payload) => ErrorFrame::application_error(stream_id, payload.clone()),
            Self::Rejected(message) => ErrorFrame::rejected(stream_id, message.clone()),
            Self::Canceled(message) => ErrorFrame::canceled(stream_id, message.clone()),
            Self::Invalid(message) | Self::FlowControl(message) | Self::Protocol(message) => {
                ErrorFrame::invalid(stream_id, message.clone())
            }
            other => ErrorFrame::application_error(stream_id, Payload::new(other.to_string())),
        }
    }
}

/// Errors from the connection engine and its setup path.
#[derive(Debug, thiserror::Error)]
pub enum RSocketError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection is disconnected")]
    Disconnected,

    #[error("connection is closed")]
    Closed,

    /// `connect` was called while a transport is attached.
    #[error("a transport is already connected")]
    AlreadyConnected,

    #[error("protocol version mismatch (negotiated {negotiated}, requested {requested})")]
    ProtocolVersionMismatch {
        negotiated: ProtocolVersion,
        requested: ProtocolVersion,
    },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(ProtocolVersion),

    #[error("ran out of stream ids")]
    StreamIdsExhausted,

    #[error("operation requires the {0} role")]
    WrongRole(&'static str),

    /// Cold resumption needs a handler to rebuild streams.
    #[error("cold resumption requires a cold-resume handler")]
    ColdResumeUnavailable,

    /// The acceptor refused the first frame and sent this error to the peer.
    #[error("setup rejected ({code}): {message}")]
    SetupRejected { code: ErrorCode, message: String },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("resume failed: {0}")]
    ResumeFailed(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type Result<T> = std::result::Result<T, RSocketError>;
