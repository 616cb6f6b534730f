use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_FIELD_SIZE: usize = 3;

/// Largest frame the 24-bit length prefix can describe.
pub const MAX_FRAME_LENGTH: usize = 0xFF_FFFF;

/// Prefix a serialized frame with its length.
///
/// Wire format:
/// ```text
/// ┌───────────────┬──────────────────────┐
/// │ Length (3B BE)│ Frame (Length bytes) │
/// └───────────────┴──────────────────────┘
/// ```
pub fn encode_frame(frame: &[u8], dst: &mut BytesMut) -> Result<()> {
    if frame.len() > MAX_FRAME_LENGTH {
        return Err(FrameError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_LENGTH,
        });
    }
    dst.reserve(LENGTH_FIELD_SIZE + frame.len());
    dst.put_uint(frame.len() as u64, LENGTH_FIELD_SIZE);
    dst.put_slice(frame);
    Ok(())
}

/// Split one length-prefixed frame off the front of `src`.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>> {
    if src.len() < LENGTH_FIELD_SIZE {
        return Ok(None);
    }

    let frame_len = (&src[..LENGTH_FIELD_SIZE]).get_uint(LENGTH_FIELD_SIZE) as usize;
    if frame_len > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: frame_len,
            max: max_frame_size,
        });
    }

    if src.len() < LENGTH_FIELD_SIZE + frame_len {
        return Ok(None);
    }

    src.advance(LENGTH_FIELD_SIZE);
    Ok(Some(src.split_to(frame_len).freeze()))
}

/// Configuration for the length-prefix codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame size in bytes. Default and ceiling: 16 MiB - 1.
    pub max_frame_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_LENGTH,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
