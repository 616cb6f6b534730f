//! Connection configuration and handshake parameters.

use std::fmt;
use std::time::Duration;

use rsocket_frame::{
    FrameFlags, FrameHeader, FrameType, Payload, ProtocolVersion, ResumePosition, ResumeFrame,
    ResumeToken, SetupFrame, MAX_FRAME_LENGTH,
};

/// Keepalive period advertised by clients unless configured otherwise.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Max lifetime advertised in SETUP.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(90);

/// Bytes of sent frames kept for warm resumption.
pub const DEFAULT_RESUME_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Largest data plus metadata carried by one outbound frame.
///
/// Leaves room for the frame header, request-n and metadata length fields.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = MAX_FRAME_LENGTH - 16;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Which side of the connection this engine is.
///
/// The initiator (client) opens odd-numbered streams and sends keepalives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Initiator,
    Acceptor,
}

impl ConnectionRole {
    pub fn is_initiator(self) -> bool {
        matches!(self, Self::Initiator)
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Engine tuning shared by clients and servers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Initiators send KEEPALIVE frames at the SETUP interval when set.
    pub send_keepalives: bool,
    /// Payloads larger than this are split into FOLLOWS fragments.
    pub max_fragment_size: usize,
    /// Capacity of the warm-resume buffer in bytes.
    pub resume_buffer_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_keepalives: true,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            resume_buffer_capacity: DEFAULT_RESUME_BUFFER_CAPACITY,
        }
    }
}

/// Everything a client announces in its SETUP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupParameters {
    pub version: ProtocolVersion,
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub resumable: bool,
    /// Sent only when `resumable` is set.
    pub token: ResumeToken,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

impl Default for SetupParameters {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::LATEST,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            resumable: false,
            token: ResumeToken::generate(),
            metadata_mime_type: DEFAULT_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_MIME_TYPE.to_string(),
            payload: Payload::default(),
        }
    }
}

impl SetupParameters {
    /// Resumable setup with a freshly generated token.
    pub fn resumable() -> Self {
        Self {
            resumable: true,
            ..Self::default()
        }
    }

    pub fn to_frame(&self) -> SetupFrame {
        let (flags, token) = if self.resumable {
            (FrameFlags::RESUME_ENABLE, self.token.clone())
        } else {
            (FrameFlags::empty(), ResumeToken::default())
        };
        SetupFrame {
            header: FrameHeader::new(FrameType::Setup, 0, flags),
            version: self.version,
            keepalive_time: self.keepalive_interval,
            max_lifetime: self.max_lifetime,
            token,
            metadata_mime_type: self.metadata_mime_type.clone(),
            data_mime_type: self.data_mime_type.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl From<SetupFrame> for SetupParameters {
    fn from(frame: SetupFrame) -> Self {
        Self {
            resumable: frame.resume_enabled(),
            version: frame.version,
            keepalive_interval: frame.keepalive_time,
            max_lifetime: frame.max_lifetime,
            token: frame.token,
            metadata_mime_type: frame.metadata_mime_type,
            data_mime_type: frame.data_mime_type,
            payload: frame.payload,
        }
    }
}

/// Contents of a RESUME frame as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeParameters {
    pub token: ResumeToken,
    /// Last server position the client received.
    pub server_position: ResumePosition,
    /// Earliest client position the client can still replay.
    pub client_position: ResumePosition,
    pub version: ProtocolVersion,
}

impl From<ResumeFrame> for ResumeParameters {
    fn from(frame: ResumeFrame) -> Self {
        Self {
            token: frame.token,
            server_position: frame.last_received_server_position,
            client_position: frame.first_available_client_position,
            version: frame.version,
        }
    }
}
