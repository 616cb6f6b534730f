use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hasher};

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

/// Identifier of one logical stream on a connection. Zero is the connection itself.
pub type StreamId = u32;

/// Byte position in the resumable frame sequence.
pub type ResumePosition = i64;

/// Sentinel for "no position supplied" in resume negotiation.
pub const UNSPECIFIED_RESUME_POSITION: ResumePosition = -1;

/// Wire frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Reserved = 0x00,
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Resume = 0x0D,
    ResumeOk = 0x0E,
    Ext = 0x3F,
}

impl FrameType {
    /// Decode a 6-bit type code. Unknown codes map to `Reserved`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Setup,
            0x02 => Self::Lease,
            0x03 => Self::Keepalive,
            0x04 => Self::RequestResponse,
            0x05 => Self::RequestFnf,
            0x06 => Self::RequestStream,
            0x07 => Self::RequestChannel,
            0x08 => Self::RequestN,
            0x09 => Self::Cancel,
            0x0A => Self::Payload,
            0x0B => Self::Error,
            0x0C => Self::MetadataPush,
            0x0D => Self::Resume,
            0x0E => Self::ResumeOk,
            0x3F => Self::Ext,
            _ => Self::Reserved,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Frames that open a new stream.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::RequestResponse | Self::RequestFnf | Self::RequestStream | Self::RequestChannel
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Reserved => "RESERVED",
            Self::Setup => "SETUP",
            Self::Lease => "LEASE",
            Self::Keepalive => "KEEPALIVE",
            Self::RequestResponse => "REQUEST_RESPONSE",
            Self::RequestFnf => "REQUEST_FNF",
            Self::RequestStream => "REQUEST_STREAM",
            Self::RequestChannel => "REQUEST_CHANNEL",
            Self::RequestN => "REQUEST_N",
            Self::Cancel => "CANCEL",
            Self::Payload => "PAYLOAD",
            Self::Error => "ERROR",
            Self::MetadataPush => "METADATA_PUSH",
            Self::Resume => "RESUME",
            Self::ResumeOk => "RESUME_OK",
            Self::Ext => "EXT",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// The 10-bit flags field of the frame header.
    ///
    /// Several flags share a bit and are interpreted per frame type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u16 {
        /// Frame may be ignored if not understood.
        const IGNORE            = 0b10_0000_0000;
        /// Metadata is present.
        const METADATA          = 0b01_0000_0000;
        /// More fragments follow (request and payload frames).
        const FOLLOWS           = 0b00_1000_0000;
        /// Client requests resumption (SETUP).
        const RESUME_ENABLE     = 0b00_1000_0000;
        /// Peer must echo this keepalive (KEEPALIVE).
        const KEEPALIVE_RESPOND = 0b00_1000_0000;
        /// Stream completion (PAYLOAD, REQUEST_CHANNEL).
        const COMPLETE          = 0b00_0100_0000;
        /// Client honours leases (SETUP).
        const LEASE             = 0b00_0100_0000;
        /// Payload carries a value (PAYLOAD).
        const NEXT              = 0b00_0010_0000;
    }
}

/// Error codes carried by ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Reserved,
    InvalidSetup,
    UnsupportedSetup,
    RejectedSetup,
    RejectedResume,
    ConnectionError,
    ConnectionClose,
    ApplicationError,
    Rejected,
    Canceled,
    Invalid,
    Other(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0000_0000 => Self::Reserved,
            0x0000_0001 => Self::InvalidSetup,
            0x0000_0002 => Self::UnsupportedSetup,
            0x0000_0003 => Self::RejectedSetup,
            0x0000_0004 => Self::RejectedResume,
            0x0000_0101 => Self::ConnectionError,
            0x0000_0102 => Self::ConnectionClose,
            0x0000_0201 => Self::ApplicationError,
            0x0000_0202 => Self::Rejected,
            0x0000_0203 => Self::Canceled,
            0x0000_0204 => Self::Invalid,
            other => Self::Other(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Reserved => 0x0000_0000,
            Self::InvalidSetup => 0x0000_0001,
            Self::UnsupportedSetup => 0x0000_0002,
            Self::RejectedSetup => 0x0000_0003,
            Self::RejectedResume => 0x0000_0004,
            Self::ConnectionError => 0x0000_0101,
            Self::ConnectionClose => 0x0000_0102,
            Self::ApplicationError => 0x0000_0201,
            Self::Rejected => 0x0000_0202,
            Self::Canceled => 0x0000_0203,
            Self::Invalid => 0x0000_0204,
            Self::Other(code) => code,
        }
    }

    /// Codes that are only legal on stream 0.
    pub fn is_connection_scoped(self) -> bool {
        matches!(
            self,
            Self::InvalidSetup
                | Self::UnsupportedSetup
                | Self::RejectedSetup
                | Self::RejectedResume
                | Self::ConnectionError
                | Self::ConnectionClose
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserved => f.write_str("RESERVED"),
            Self::InvalidSetup => f.write_str("INVALID_SETUP"),
            Self::UnsupportedSetup => f.write_str("UNSUPPORTED_SETUP"),
            Self::RejectedSetup => f.write_str("REJECTED_SETUP"),
            Self::RejectedResume => f.write_str("REJECTED_RESUME"),
            Self::ConnectionError => f.write_str("CONNECTION_ERROR"),
            Self::ConnectionClose => f.write_str("CONNECTION_CLOSE"),
            Self::ApplicationError => f.write_str("APPLICATION_ERROR"),
            Self::Rejected => f.write_str("REJECTED"),
            Self::Canceled => f.write_str("CANCELED"),
            Self::Invalid => f.write_str("INVALID"),
            Self::Other(code) => write!(f, "{code:#010x}"),
        }
    }
}

/// Protocol version negotiated in SETUP/RESUME.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V1_0: Self = Self { major: 1, minor: 0 };
    pub const LATEST: Self = Self::V1_0;

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A unit of application data with optional metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
    pub metadata: Option<Bytes>,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: Some(metadata.into()),
        }
    }

    /// Total bytes of data and metadata.
    pub fn len(&self) -> usize {
        self.data.len() + self.metadata.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data as text, replacing invalid UTF-8.
    pub fn data_utf8_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::new(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

/// Opaque session token identifying a resumable connection.
///
/// Treated as credential material: `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Generate a fresh random 16-byte token.
    pub fn generate() -> Self {
        let mut out = BytesMut::with_capacity(16);
        for _ in 0..2 {
            let mut hasher = RandomState::new().build_hasher();
            hasher.write_u128(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or_default(),
            );
            out.extend_from_slice(&hasher.finish().to_be_bytes());
        }
        Self(out.freeze())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken(<redacted:{} bytes>)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_frame_type_codes_are_reserved() {
        assert_eq!(FrameType::from_u8(0x0F), FrameType::Reserved);
        assert_eq!(FrameType::from_u8(0x3E), FrameType::Reserved);
        assert_eq!(FrameType::from_u8(0x3F), FrameType::Ext);
        assert_eq!(FrameType::from_u8(0x0A), FrameType::Payload);
    }

    #[test]
    fn error_code_preserves_unknown_values() {
        assert_eq!(ErrorCode::from_u32(0x201), ErrorCode::ApplicationError);
        assert_eq!(ErrorCode::from_u32(0x301), ErrorCode::Other(0x301));
        assert_eq!(ErrorCode::Other(0x301).as_u32(), 0x301);
        assert!(ErrorCode::RejectedResume.is_connection_scoped());
        assert!(!ErrorCode::Canceled.is_connection_scoped());
    }

    #[test]
    fn shared_flag_bits_alias() {
        assert_eq!(FrameFlags::FOLLOWS.bits(), FrameFlags::RESUME_ENABLE.bits());
        assert_eq!(FrameFlags::COMPLETE.bits(), FrameFlags::LEASE.bits());
        assert_eq!(FrameFlags::all().bits(), 0x3E0);
    }

    #[test]
    fn generated_tokens_differ_and_debug_is_redacted() {
        let a = ResumeToken::generate();
        let b = ResumeToken::generate();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert_eq!(format!("{a:?}"), "ResumeToken(<redacted:16 bytes>)");
    }

    #[test]
    fn payload_len_counts_metadata() {
        let payload = Payload::with_metadata("data", "meta");
        assert_eq!(payload.len(), 8);
        assert!(Payload::default().is_empty());
    }
}
