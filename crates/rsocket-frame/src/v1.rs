//! Version 1.0 wire layout.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::frame::{
    CancelFrame, ErrorFrame, ExtFrame, Frame, FrameHeader, KeepaliveFrame, LeaseFrame,
    MetadataPushFrame, PayloadFrame, RequestFrame, RequestNFrame, ResumeFrame, ResumeOkFrame,
    SetupFrame,
};
use crate::serializer::FrameSerializer;
use crate::types::{
    ErrorCode, FrameFlags, FrameType, Payload, ProtocolVersion, ResumeToken, StreamId,
};

/// Stream id (4) + type and flags (2).
const HEADER_SIZE: usize = 6;
/// Header plus the major/minor version of a SETUP or RESUME frame.
const MIN_BYTES_FOR_AUTODETECT: usize = HEADER_SIZE + 4;
const METADATA_LENGTH_SIZE: usize = 3;
const MAX_METADATA_LENGTH: usize = 0xFF_FFFF;
const FLAGS_MASK: u16 = 0x03FF;
const FRAME_TYPE_SHIFT: u16 = 10;
const MAX_MIME_LENGTH: usize = u8::MAX as usize;
const MAX_TOKEN_LENGTH: usize = u16::MAX as usize;

/// Serializer for protocol version 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSerializerV1;

impl FrameSerializerV1 {
    pub const VERSION: ProtocolVersion = ProtocolVersion::V1_0;

    /// Version carried by a stream-0 SETUP or RESUME frame, if it is 1.0.
    pub fn detect_protocol_version(frame: &[u8]) -> Option<ProtocolVersion> {
        if frame.len() < MIN_BYTES_FOR_AUTODETECT {
            return None;
        }
        let mut buf = frame;
        let stream_id = buf.get_u32();
        let frame_type = FrameType::from_u8((buf.get_u16() >> FRAME_TYPE_SHIFT) as u8);
        let version = ProtocolVersion::new(buf.get_u16(), buf.get_u16());

        if stream_id == 0
            && matches!(frame_type, FrameType::Setup | FrameType::Resume)
            && version == Self::VERSION
        {
            Some(version)
        } else {
            None
        }
    }
}

impl FrameSerializer for FrameSerializerV1 {
    fn protocol_version(&self) -> ProtocolVersion {
        Self::VERSION
    }

    fn peek_frame_type(&self, frame: &[u8]) -> FrameType {
        if frame.len() < HEADER_SIZE {
            return FrameType::Reserved;
        }
        FrameType::from_u8(frame[4] >> 2)
    }

    fn peek_stream_id(&self, frame: &[u8]) -> Option<StreamId> {
        if frame.len() < 4 {
            return None;
        }
        let stream_id = (&frame[..4]).get_u32();
        ((stream_id & 0x8000_0000) == 0).then_some(stream_id)
    }

    fn serialize_out(&self, frame: &Frame) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + 16);
        match frame {
            Frame::Setup(f) => encode_setup(f, &mut out)?,
            Frame::Lease(f) => {
                let mut flags = f.header.flags - FrameFlags::METADATA;
                if f.metadata.is_some() {
                    flags |= FrameFlags::METADATA;
                }
                put_header(&mut out, &f.header, flags);
                out.put_u32(duration_to_millis(f.ttl));
                out.put_u32(f.number_of_requests.min(i32::MAX as u32));
                if let Some(metadata) = &f.metadata {
                    out.put_slice(metadata);
                }
            }
            Frame::Keepalive(f) => {
                put_header(&mut out, &f.header, f.header.flags);
                out.put_i64(f.position.max(0));
                out.put_slice(&f.data);
            }
            Frame::Request(f) => {
                put_header(&mut out, &f.header, payload_flags(f.header.flags, &f.payload));
                if matches!(
                    f.header.frame_type,
                    FrameType::RequestStream | FrameType::RequestChannel
                ) {
                    out.put_u32(f.initial_request_n.min(i32::MAX as u32));
                }
                put_payload(&mut out, f.header.frame_type, &f.payload)?;
            }
            Frame::RequestN(f) => {
                put_header(&mut out, &f.header, f.header.flags);
                out.put_u32(f.request_n.min(i32::MAX as u32));
            }
            Frame::Cancel(f) => put_header(&mut out, &f.header, f.header.flags),
            Frame::Payload(f) => {
                put_header(&mut out, &f.header, payload_flags(f.header.flags, &f.payload));
                put_payload(&mut out, FrameType::Payload, &f.payload)?;
            }
            Frame::Error(f) => {
                put_header(&mut out, &f.header, payload_flags(f.header.flags, &f.payload));
                out.put_u32(f.code.as_u32());
                put_payload(&mut out, FrameType::Error, &f.payload)?;
            }
            Frame::MetadataPush(f) => {
                put_header(&mut out, &f.header, f.header.flags | FrameFlags::METADATA);
                out.put_slice(&f.metadata);
            }
            Frame::Resume(f) => {
                if f.token.len() > MAX_TOKEN_LENGTH {
                    return Err(FrameError::malformed(
                        FrameType::Resume,
                        format!("resume token too long ({} bytes)", f.token.len()),
                    ));
                }
                put_header(&mut out, &f.header, f.header.flags);
                out.put_u16(f.version.major);
                out.put_u16(f.version.minor);
                out.put_u16(f.token.len() as u16);
                out.put_slice(f.token.as_bytes());
                out.put_i64(f.last_received_server_position);
                out.put_i64(f.first_available_client_position);
            }
            Frame::ResumeOk(f) => {
                put_header(&mut out, &f.header, f.header.flags);
                out.put_i64(f.position);
            }
            Frame::Ext(f) => {
                put_header(&mut out, &f.header, payload_flags(f.header.flags, &f.payload));
                out.put_u32(f.extended_type);
                put_payload(&mut out, FrameType::Ext, &f.payload)?;
            }
        }
        Ok(out.freeze())
    }

    fn deserialize_from(&self, frame: Bytes) -> Result<Frame> {
        let mut cursor = Cursor::new(frame);
        let header = cursor.header()?;
        cursor.frame_type = header.frame_type;

        let frame = match header.frame_type {
            FrameType::Setup => Frame::Setup(decode_setup(header, &mut cursor)?),
            FrameType::Lease => {
                let ttl = cursor.non_negative_i32("ttl")?;
                let number_of_requests = cursor.non_negative_i32("number of requests")?;
                let metadata = header
                    .flags
                    .contains(FrameFlags::METADATA)
                    .then(|| cursor.rest());
                Frame::Lease(LeaseFrame {
                    header,
                    ttl: Duration::from_millis(u64::from(ttl)),
                    number_of_requests,
                    metadata,
                })
            }
            FrameType::Keepalive => {
                let position = cursor.i64()?;
                if position < 0 {
                    return Err(cursor.malformed("negative keepalive position"));
                }
                Frame::Keepalive(KeepaliveFrame {
                    header,
                    position,
                    data: cursor.rest(),
                })
            }
            FrameType::RequestResponse | FrameType::RequestFnf => Frame::Request(RequestFrame {
                header,
                initial_request_n: 0,
                payload: cursor.payload(header.flags)?,
            }),
            FrameType::RequestStream | FrameType::RequestChannel => {
                let initial_request_n = cursor.non_negative_i32("initial request n")?;
                Frame::Request(RequestFrame {
                    header,
                    initial_request_n,
                    payload: cursor.payload(header.flags)?,
                })
            }
            FrameType::RequestN => {
                let request_n = cursor.non_negative_i32("request n")?;
                if request_n == 0 {
                    return Err(cursor.malformed("request n must be positive"));
                }
                Frame::RequestN(RequestNFrame { header, request_n })
            }
            FrameType::Cancel => Frame::Cancel(CancelFrame { header }),
            FrameType::Payload => Frame::Payload(PayloadFrame {
                header,
                payload: cursor.payload(header.flags)?,
            }),
            FrameType::Error => {
                let code = ErrorCode::from_u32(cursor.u32()?);
                Frame::Error(ErrorFrame {
                    header,
                    code,
                    payload: cursor.payload(header.flags)?,
                })
            }
            FrameType::MetadataPush => Frame::MetadataPush(MetadataPushFrame {
                header,
                metadata: cursor.rest(),
            }),
            FrameType::Resume => {
                let version = ProtocolVersion::new(cursor.u16()?, cursor.u16()?);
                let token_len = usize::from(cursor.u16()?);
                let token = ResumeToken::new(cursor.take(token_len)?);
                Frame::Resume(ResumeFrame {
                    header,
                    version,
                    token,
                    last_received_server_position: cursor.i64()?,
                    first_available_client_position: cursor.i64()?,
                })
            }
            FrameType::ResumeOk => Frame::ResumeOk(ResumeOkFrame {
                header,
                position: cursor.i64()?,
            }),
            FrameType::Ext => {
                let extended_type = cursor.u32()?;
                Frame::Ext(ExtFrame {
                    header,
                    extended_type,
                    payload: cursor.payload(header.flags)?,
                })
            }
            FrameType::Reserved => return Err(FrameError::UnsupportedFrameType(FrameType::Reserved)),
        };
        Ok(frame)
    }
}

fn put_header(out: &mut BytesMut, header: &FrameHeader, flags: FrameFlags) {
    out.put_u32(header.stream_id & 0x7FFF_FFFF);
    let frame_type = u16::from(header.frame_type.as_u8()) << FRAME_TYPE_SHIFT;
    out.put_u16(frame_type | (flags.bits() & FLAGS_MASK));
}

fn payload_flags(flags: FrameFlags, payload: &Payload) -> FrameFlags {
    if payload.metadata.is_some() {
        flags | FrameFlags::METADATA
    } else {
        flags - FrameFlags::METADATA
    }
}

fn put_payload(out: &mut BytesMut, frame_type: FrameType, payload: &Payload) -> Result<()> {
    if let Some(metadata) = &payload.metadata {
        if metadata.len() > MAX_METADATA_LENGTH {
            return Err(FrameError::malformed(
                frame_type,
                format!("metadata too long ({} bytes)", metadata.len()),
            ));
        }
        out.put_uint(metadata.len() as u64, METADATA_LENGTH_SIZE);
        out.put_slice(metadata);
    }
    out.put_slice(&payload.data);
    Ok(())
}

fn encode_setup(frame: &SetupFrame, out: &mut BytesMut) -> Result<()> {
    let malformed = |reason: String| FrameError::malformed(FrameType::Setup, reason);
    if frame.metadata_mime_type.len() > MAX_MIME_LENGTH
        || frame.data_mime_type.len() > MAX_MIME_LENGTH
    {
        return Err(malformed("mime type longer than 255 bytes".to_string()));
    }
    if frame.token.len() > MAX_TOKEN_LENGTH {
        return Err(malformed(format!(
            "resume token too long ({} bytes)",
            frame.token.len()
        )));
    }

    let mut flags = payload_flags(frame.header.flags, &frame.payload);
    if frame.token.is_empty() {
        flags -= FrameFlags::RESUME_ENABLE;
    } else {
        flags |= FrameFlags::RESUME_ENABLE;
    }

    put_header(out, &frame.header, flags);
    out.put_u16(frame.version.major);
    out.put_u16(frame.version.minor);
    out.put_u32(duration_to_millis(frame.keepalive_time));
    out.put_u32(duration_to_millis(frame.max_lifetime));
    if !frame.token.is_empty() {
        out.put_u16(frame.token.len() as u16);
        out.put_slice(frame.token.as_bytes());
    }
    out.put_u8(frame.metadata_mime_type.len() as u8);
    out.put_slice(frame.metadata_mime_type.as_bytes());
    out.put_u8(frame.data_mime_type.len() as u8);
    out.put_slice(frame.data_mime_type.as_bytes());
    put_payload(out, FrameType::Setup, &frame.payload)
}

fn decode_setup(header: FrameHeader, cursor: &mut Cursor) -> Result<SetupFrame> {
    let version = ProtocolVersion::new(cursor.u16()?, cursor.u16()?);
    let keepalive_ms = cursor.non_negative_i32("keepalive time")?;
    let lifetime_ms = cursor.non_negative_i32("max lifetime")?;
    if keepalive_ms == 0 || lifetime_ms == 0 {
        return Err(cursor.malformed("keepalive time and max lifetime must be positive"));
    }

    let token = if header.flags.contains(FrameFlags::RESUME_ENABLE) {
        let len = usize::from(cursor.u16()?);
        ResumeToken::new(cursor.take(len)?)
    } else {
        ResumeToken::default()
    };

    let metadata_mime_type = cursor.mime_type()?;
    let data_mime_type = cursor.mime_type()?;
    let payload = cursor.payload(header.flags)?;

    Ok(SetupFrame {
        header,
        version,
        keepalive_time: Duration::from_millis(u64::from(keepalive_ms)),
        max_lifetime: Duration::from_millis(u64::from(lifetime_ms)),
        token,
        metadata_mime_type,
        data_mime_type,
        payload,
    })
}

fn duration_to_millis(duration: Duration) -> u32 {
    duration.as_millis().min(i32::MAX as u128) as u32
}

/// Bounds-checked reader over one frame.
struct Cursor {
    buf: Bytes,
    frame_type: FrameType,
}

impl Cursor {
    fn new(buf: Bytes) -> Self {
        Self {
            buf,
            frame_type: FrameType::Reserved,
        }
    }

    fn malformed(&self, reason: &str) -> FrameError {
        FrameError::malformed(self.frame_type, reason)
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(self.malformed(&format!(
                "truncated: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn header(&mut self) -> Result<FrameHeader> {
        self.need(HEADER_SIZE)?;
        let stream_id = self.buf.get_u32();
        let type_and_flags = self.buf.get_u16();
        let frame_type = FrameType::from_u8((type_and_flags >> FRAME_TYPE_SHIFT) as u8);
        if (stream_id & 0x8000_0000) != 0 {
            return Err(FrameError::malformed(frame_type, "stream id has reserved bit set"));
        }
        Ok(FrameHeader {
            frame_type,
            flags: FrameFlags::from_bits_truncate(type_and_flags & FLAGS_MASK),
            stream_id,
        })
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn non_negative_i32(&mut self, field: &str) -> Result<u32> {
        self.need(4)?;
        let value = self.buf.get_i32();
        u32::try_from(value).map_err(|_| self.malformed(&format!("negative {field}: {value}")))
    }

    fn take(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    fn mime_type(&mut self) -> Result<String> {
        self.need(1)?;
        let len = usize::from(self.buf.get_u8());
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| self.malformed("mime type is not utf-8"))
    }

    fn payload(&mut self, flags: FrameFlags) -> Result<Payload> {
        let metadata = if flags.contains(FrameFlags::METADATA) {
            self.need(METADATA_LENGTH_SIZE)?;
            let len = self.buf.get_uint(METADATA_LENGTH_SIZE) as usize;
            Some(self.take(len)?)
        } else {
            None
        };
        Ok(Payload {
            data: self.rest(),
            metadata,
        })
    }
}
