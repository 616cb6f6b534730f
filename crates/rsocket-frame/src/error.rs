use crate::types::{FrameType, ProtocolVersion};

/// Errors that can occur while framing, encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// The frame body does not match the layout for its type.
    #[error("malformed {frame_type} frame: {reason}")]
    Malformed {
        frame_type: FrameType,
        reason: String,
    },

    /// The frame type has no decoder.
    #[error("cannot decode frame of type {0}")]
    UnsupportedFrameType(FrameType),

    /// No serializer exists for the requested protocol version.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(ProtocolVersion),
}

impl FrameError {
    pub(crate) fn malformed(frame_type: FrameType, reason: impl Into<String>) -> Self {
        Self::Malformed {
            frame_type,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
