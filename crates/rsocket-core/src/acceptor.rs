//! Server-side handling of the first frame on a new transport.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rsocket_frame::{
    create_autodetected_serializer, ErrorFrame, Frame, FrameError, FrameReader, FrameSerializer,
    FrameSerializerV1, FrameType, FrameWriter, SetupFrame,
};
use tracing::{debug, info, warn};

use crate::error::{RSocketError, Result};
use crate::params::{ResumeParameters, SetupParameters};

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Time allowed for the first frame to arrive.
    pub timeout: Duration,
    /// Largest first frame accepted.
    pub max_setup_frame_size: usize,
    /// Accept resumable SETUP and RESUME frames.
    pub allow_resumption: bool,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_setup_frame_size: 64 * 1024,
            allow_resumption: true,
        }
    }
}

/// What the first frame asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Setup(SetupParameters),
    Resume(ResumeParameters),
}

/// Validates SETUP/RESUME and answers rejections with a stream-0 ERROR.
#[derive(Debug, Clone, Default)]
pub struct SetupResumeAcceptor {
    config: AcceptorConfig,
}

impl SetupResumeAcceptor {
    pub fn new(config: AcceptorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AcceptorConfig {
        &self.config
    }

    /// Read and validate the first frame of a connection.
    ///
    /// On rejection the ERROR frame is written before the error is returned.
    pub fn accept<R: Read, W: Write>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Handshake> {
        let deadline = Instant::now() + self.config.timeout;
        let frame = recv_first_frame(reader, deadline, self.config.timeout, self.config.max_setup_frame_size)?;
        self.accept_frame(frame, writer)
    }

    /// Validate an already-read first frame.
    pub fn accept_frame<W: Write>(&self, frame: Bytes, writer: &mut FrameWriter<W>) -> Result<Handshake> {
        let Some(serializer) = create_autodetected_serializer(&frame) else {
            return Err(self.reject(writer, classify_undetectable(&frame)));
        };
        match serializer.deserialize_from(frame) {
            Ok(Frame::Setup(setup)) => self.accept_setup(setup, writer),
            Ok(Frame::Resume(resume)) => {
                if !self.config.allow_resumption {
                    return Err(self.reject(writer, ErrorFrame::rejected_resume("resumption is disabled")));
                }
                if resume.token.is_empty() {
                    return Err(self.reject(writer, ErrorFrame::rejected_resume("resume token is empty")));
                }
                debug!(
                    server_position = resume.last_received_server_position,
                    client_position = resume.first_available_client_position,
                    "resume requested"
                );
                Ok(Handshake::Resume(ResumeParameters::from(resume)))
            }
            Ok(other) => Err(self.reject(
                writer,
                ErrorFrame::invalid_setup(format!("first frame must be SETUP or RESUME, got {}", other.frame_type())),
            )),
            Err(err) => Err(self.reject(writer, ErrorFrame::invalid_setup(format!("malformed first frame: {err}")))),
        }
    }

    fn accept_setup<W: Write>(&self, setup: SetupFrame, writer: &mut FrameWriter<W>) -> Result<Handshake> {
        if setup.lease_enabled() {
            return Err(self.reject(writer, ErrorFrame::unsupported_setup("lease is not supported")));
        }
        if setup.resume_enabled() {
            if !self.config.allow_resumption {
                return Err(self.reject(writer, ErrorFrame::unsupported_setup("resumption is disabled")));
            }
            if setup.token.is_empty() {
                return Err(self.reject(writer, ErrorFrame::invalid_setup("resume token is empty")));
            }
        }
        info!(
            version = %setup.version,
            resumable = setup.resume_enabled(),
            keepalive_ms = setup.keepalive_time.as_millis() as u64,
            data_mime_type = %setup.data_mime_type,
            "setup accepted"
        );
        Ok(Handshake::Setup(SetupParameters::from(setup)))
    }

    /// Send `error` on stream 0 and turn it into the matching error.
    pub fn reject<W: Write>(&self, writer: &mut FrameWriter<W>, error: ErrorFrame) -> RSocketError {
        let message = error.message();
        warn!(code = %error.code, reason = %message, "rejecting connection");
        match FrameSerializerV1.serialize_out(&Frame::Error(error.clone())) {
            Ok(bytes) => {
                if let Err(err) = writer.send(&bytes) {
                    debug!(error = %err, "failed to send rejection");
                }
            }
            Err(err) => debug!(error = %err, "failed to encode rejection"),
        }
        RSocketError::SetupRejected {
            code: error.code,
            message,
        }
    }
}

/// Why a first frame could not be matched to a serializer.
fn classify_undetectable(frame: &[u8]) -> ErrorFrame {
    let frame_type = FrameSerializerV1.peek_frame_type(frame);
    let stream_id = FrameSerializerV1.peek_stream_id(frame);
    match (frame_type, stream_id) {
        (FrameType::Setup, Some(0)) => ErrorFrame::unsupported_setup("unsupported protocol version"),
        (FrameType::Resume, Some(0)) => ErrorFrame::rejected_resume("unsupported protocol version"),
        _ => ErrorFrame::invalid_setup("first frame must be SETUP or RESUME on stream 0"),
    }
}

fn recv_first_frame<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    timeout: Duration,
    max_setup_frame_size: usize,
) -> Result<Bytes> {
    loop {
        if Instant::now() >= deadline {
            return Err(RSocketError::Timeout(timeout));
        }
        match reader.read_frame() {
            Ok(frame) => {
                if frame.len() > max_setup_frame_size {
                    return Err(RSocketError::HandshakeFailed(format!(
                        "first frame too large: {} (max {max_setup_frame_size})",
                        frame.len()
                    )));
                }
                return Ok(frame);
            }
            Err(FrameError::Io(err)) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(RSocketError::HandshakeFailed(
                    "connection closed before SETUP".to_string(),
                ));
            }
            Err(err) => return Err(RSocketError::Frame(err)),
        }
    }
}
