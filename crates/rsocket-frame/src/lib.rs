//! RSocket frames: the typed model, the version 1.0 wire serializer, and
//! length-prefixed framing for byte-stream transports.
//!
//! Every frame on a byte stream is preceded by a 3-byte big-endian length.
//! The frame itself starts with a 6-byte header:
//! - A 4-byte big-endian stream id (top bit reserved)
//! - A 6-bit frame type and 10 bits of flags
//!
//! Stream id 0 carries connection-scoped frames.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod error;
pub mod frame;
pub mod reader;
pub mod serializer;
pub mod types;
pub mod v1;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::LengthPrefixCodec;
pub use codec::{
    decode_frame, encode_frame, FrameConfig, LENGTH_FIELD_SIZE, MAX_FRAME_LENGTH,
};
pub use error::{FrameError, Result};
pub use frame::{
    CancelFrame, ErrorFrame, ExtFrame, Frame, FrameHeader, KeepaliveFrame, LeaseFrame,
    MetadataPushFrame, PayloadFrame, RequestFrame, RequestNFrame, ResumeFrame, ResumeOkFrame,
    SetupFrame,
};
pub use reader::FrameReader;
pub use serializer::{create_autodetected_serializer, create_frame_serializer, FrameSerializer};
pub use types::{
    ErrorCode, FrameFlags, FrameType, Payload, ProtocolVersion, ResumePosition, ResumeToken,
    StreamId, UNSPECIFIED_RESUME_POSITION,
};
pub use v1::FrameSerializerV1;
pub use writer::FrameWriter;
