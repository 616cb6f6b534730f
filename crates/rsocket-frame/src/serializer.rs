use bytes::Bytes;

use crate::error::Result;
use crate::frame::Frame;
use crate::types::{FrameType, ProtocolVersion, StreamId};
use crate::v1::FrameSerializerV1;

/// Converts between typed frames and their wire bytes for one protocol version.
///
/// The bytes handled here exclude any transport-level length prefix.
pub trait FrameSerializer: Send + Sync {
    /// The version this serializer speaks.
    fn protocol_version(&self) -> ProtocolVersion;

    /// Frame type from the header, `Reserved` if the bytes are too short.
    fn peek_frame_type(&self, frame: &[u8]) -> FrameType;

    /// Stream id from the header, `None` if the bytes are too short or invalid.
    fn peek_stream_id(&self, frame: &[u8]) -> Option<StreamId>;

    /// Encode a frame.
    fn serialize_out(&self, frame: &Frame) -> Result<Bytes>;

    /// Decode a complete frame.
    fn deserialize_from(&self, frame: Bytes) -> Result<Frame>;
}

/// Serializer for an explicitly negotiated version, `None` if unsupported.
pub fn create_frame_serializer(version: ProtocolVersion) -> Option<Box<dyn FrameSerializer>> {
    if version == FrameSerializerV1::VERSION {
        return Some(Box::new(FrameSerializerV1));
    }
    tracing::debug!(%version, "no serializer for protocol version");
    None
}

/// Pick a serializer by inspecting the first frame of a connection.
///
/// Only a stream-0 SETUP or RESUME frame carrying a known version is accepted.
pub fn create_autodetected_serializer(first_frame: &[u8]) -> Option<Box<dyn FrameSerializer>> {
    let version = FrameSerializerV1::detect_protocol_version(first_frame)?;
    create_frame_serializer(version)
}
