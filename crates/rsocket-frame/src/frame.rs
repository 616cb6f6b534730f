//! Typed frames, one struct per wire frame type.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::types::{
    ErrorCode, FrameFlags, FrameType, Payload, ProtocolVersion, ResumePosition, ResumeToken,
    StreamId,
};

/// Fields common to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, stream_id: StreamId, flags: FrameFlags) -> Self {
        Self {
            frame_type,
            flags,
            stream_id,
        }
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[stream={}, flags={:#05x}]",
            self.frame_type,
            self.stream_id,
            self.flags.bits()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupFrame {
    pub header: FrameHeader,
    pub version: ProtocolVersion,
    pub keepalive_time: Duration,
    pub max_lifetime: Duration,
    /// Empty unless the RESUME_ENABLE flag is set.
    pub token: ResumeToken,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

impl SetupFrame {
    pub fn resume_enabled(&self) -> bool {
        self.header.flags.contains(FrameFlags::RESUME_ENABLE)
    }

    pub fn lease_enabled(&self) -> bool {
        self.header.flags.contains(FrameFlags::LEASE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFrame {
    pub header: FrameHeader,
    pub ttl: Duration,
    pub number_of_requests: u32,
    pub metadata: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveFrame {
    pub header: FrameHeader,
    /// Last position the sender has received.
    pub position: ResumePosition,
    pub data: Bytes,
}

impl KeepaliveFrame {
    pub fn new(respond: bool, position: ResumePosition, data: Bytes) -> Self {
        let flags = if respond {
            FrameFlags::KEEPALIVE_RESPOND
        } else {
            FrameFlags::empty()
        };
        Self {
            header: FrameHeader::new(FrameType::Keepalive, 0, flags),
            position,
            data,
        }
    }

    pub fn respond(&self) -> bool {
        self.header.flags.contains(FrameFlags::KEEPALIVE_RESPOND)
    }
}

/// REQUEST_RESPONSE, REQUEST_FNF, REQUEST_STREAM and REQUEST_CHANNEL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub header: FrameHeader,
    /// Zero for request-response and fire-and-forget.
    pub initial_request_n: u32,
    pub payload: Payload,
}

impl RequestFrame {
    pub fn new(
        frame_type: FrameType,
        stream_id: StreamId,
        flags: FrameFlags,
        initial_request_n: u32,
        payload: Payload,
    ) -> Self {
        Self {
            header: FrameHeader::new(frame_type, stream_id, flags),
            initial_request_n,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestNFrame {
    pub header: FrameHeader,
    pub request_n: u32,
}

impl RequestNFrame {
    pub fn new(stream_id: StreamId, request_n: u32) -> Self {
        Self {
            header: FrameHeader::new(FrameType::RequestN, stream_id, FrameFlags::empty()),
            request_n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelFrame {
    pub header: FrameHeader,
}

impl CancelFrame {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            header: FrameHeader::new(FrameType::Cancel, stream_id, FrameFlags::empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFrame {
    pub header: FrameHeader,
    pub payload: Payload,
}

impl PayloadFrame {
    pub fn new(stream_id: StreamId, flags: FrameFlags, payload: Payload) -> Self {
        Self {
            header: FrameHeader::new(FrameType::Payload, stream_id, flags),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub header: FrameHeader,
    pub code: ErrorCode,
    pub payload: Payload,
}

impl ErrorFrame {
    pub fn new(stream_id: StreamId, code: ErrorCode, payload: Payload) -> Self {
        Self {
            header: FrameHeader::new(FrameType::Error, stream_id, FrameFlags::empty()),
            code,
            payload,
        }
    }

    fn with_message(stream_id: StreamId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(stream_id, code, Payload::new(message.into()))
    }

    pub fn invalid_setup(message: impl Into<String>) -> Self {
        Self::with_message(0, ErrorCode::InvalidSetup, message)
    }

    pub fn unsupported_setup(message: impl Into<String>) -> Self {
        Self::with_message(0, ErrorCode::UnsupportedSetup, message)
    }

    pub fn rejected_setup(message: impl Into<String>) -> Self {
        Self::with_message(0, ErrorCode::RejectedSetup, message)
    }

    pub fn rejected_resume(message: impl Into<String>) -> Self {
        Self::with_message(0, ErrorCode::RejectedResume, message)
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::with_message(0, ErrorCode::ConnectionError, message)
    }

    pub fn connection_close(message: impl Into<String>) -> Self {
        Self::with_message(0, ErrorCode::ConnectionClose, message)
    }

    pub fn application_error(stream_id: StreamId, payload: Payload) -> Self {
        Self::new(stream_id, ErrorCode::ApplicationError, payload)
    }

    pub fn rejected(stream_id: StreamId, message: impl Into<String>) -> Self {
        Self::with_message(stream_id, ErrorCode::Rejected, message)
    }

    pub fn canceled(stream_id: StreamId, message: impl Into<String>) -> Self {
        Self::with_message(stream_id, ErrorCode::Canceled, message)
    }

    pub fn invalid(stream_id: StreamId, message: impl Into<String>) -> Self {
        Self::with_message(stream_id, ErrorCode::Invalid, message)
    }

    /// The error text carried in the payload data.
    pub fn message(&self) -> String {
        self.payload.data_utf8_lossy()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPushFrame {
    pub header: FrameHeader,
    pub metadata: Bytes,
}

impl MetadataPushFrame {
    pub fn new(metadata: Bytes) -> Self {
        Self {
            header: FrameHeader::new(FrameType::MetadataPush, 0, FrameFlags::METADATA),
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFrame {
    pub header: FrameHeader,
    pub version: ProtocolVersion,
    pub token: ResumeToken,
    pub last_received_server_position: ResumePosition,
    pub first_available_client_position: ResumePosition,
}

impl ResumeFrame {
    pub fn new(
        token: ResumeToken,
        last_received_server_position: ResumePosition,
        first_available_client_position: ResumePosition,
        version: ProtocolVersion,
    ) -> Self {
        Self {
            header: FrameHeader::new(FrameType::Resume, 0, FrameFlags::empty()),
            version,
            token,
            last_received_server_position,
            first_available_client_position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeOkFrame {
    pub header: FrameHeader,
    pub position: ResumePosition,
}

impl ResumeOkFrame {
    pub fn new(position: ResumePosition) -> Self {
        Self {
            header: FrameHeader::new(FrameType::ResumeOk, 0, FrameFlags::empty()),
            position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtFrame {
    pub header: FrameHeader,
    pub extended_type: u32,
    pub payload: Payload,
}

/// Any decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Setup(SetupFrame),
    Lease(LeaseFrame),
    Keepalive(KeepaliveFrame),
    Request(RequestFrame),
    RequestN(RequestNFrame),
    Cancel(CancelFrame),
    Payload(PayloadFrame),
    Error(ErrorFrame),
    MetadataPush(MetadataPushFrame),
    Resume(ResumeFrame),
    ResumeOk(ResumeOkFrame),
    Ext(ExtFrame),
}

impl Frame {
    pub fn header(&self) -> &FrameHeader {
        match self {
            Self::Setup(f) => &f.header,
            Self::Lease(f) => &f.header,
            Self::Keepalive(f) => &f.header,
            Self::Request(f) => &f.header,
            Self::RequestN(f) => &f.header,
            Self::Cancel(f) => &f.header,
            Self::Payload(f) => &f.header,
            Self::Error(f) => &f.header,
            Self::MetadataPush(f) => &f.header,
            Self::Resume(f) => &f.header,
            Self::ResumeOk(f) => &f.header,
            Self::Ext(f) => &f.header,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.header().frame_type
    }

    pub fn stream_id(&self) -> StreamId {
        self.header().stream_id
    }
}

macro_rules! impl_from_frame {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Frame {
                fn from(frame: $ty) -> Self {
                    Self::$variant(frame)
                }
            }
        )*
    };
}

impl_from_frame! {
    Setup => SetupFrame,
    Lease => LeaseFrame,
    Keepalive => KeepaliveFrame,
    Request => RequestFrame,
    RequestN => RequestNFrame,
    Cancel => CancelFrame,
    Payload => PayloadFrame,
    Error => ErrorFrame,
    MetadataPush => MetadataPushFrame,
    Resume => ResumeFrame,
    ResumeOk => ResumeOkFrame,
    Ext => ExtFrame,
}
