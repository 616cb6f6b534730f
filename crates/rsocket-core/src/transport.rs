//! Outbound side of a connection's transport.
//!
//! Inbound frames reach the connection through its mailbox, tagged with the
//! transport id, so a transport only needs to write and close.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rsocket_frame::{FrameConfig, FrameWriter};
use rsocket_transport::SocketStream;
use tracing::{debug, warn};

use crate::command::TransportId;
use crate::error::Result;

pub trait FrameTransport: Send {
    fn id(&self) -> TransportId;

    /// Write one serialized frame. Failures are logged and the frame dropped;
    /// the reader side reports the broken connection.
    fn output_frame_or_drop(&mut self, frame: Bytes);

    fn close(&mut self);
}

/// Length-prefixed frames over a socket.
pub struct SocketTransport {
    id: TransportId,
    writer: FrameWriter<SocketStream>,
    closed: bool,
}

impl SocketTransport {
    pub fn new(stream: SocketStream) -> Self {
        Self {
            id: TransportId::next(),
            writer: FrameWriter::new(stream),
            closed: false,
        }
    }

    pub fn with_config(stream: SocketStream, config: FrameConfig) -> Result<Self> {
        Ok(Self {
            id: TransportId::next(),
            writer: FrameWriter::with_config_socket(stream, config)?,
            closed: false,
        })
    }
}

impl FrameTransport for SocketTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn output_frame_or_drop(&mut self, frame: Bytes) {
        if self.closed {
            return;
        }
        if let Err(err) = self.writer.send(&frame) {
            warn!(transport = %self.id, error = %err, "dropping frame after write failure");
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.writer.get_ref().shutdown() {
            debug!(transport = %self.id, error = %err, "socket shutdown failed");
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    frames: VecDeque<Bytes>,
    closed: bool,
}

/// Transport that collects frames in memory.
///
/// Useful for driving two engines against each other without sockets.
pub struct MemoryTransport {
    id: TransportId,
    state: Arc<Mutex<MemoryState>>,
}

/// Observer side of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryPeer {
    id: TransportId,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryPeer) {
        let id = TransportId::next();
        let state = Arc::new(Mutex::new(MemoryState::default()));
        (
            Self {
                id,
                state: Arc::clone(&state),
            },
            MemoryPeer { id, state },
        )
    }
}

impl FrameTransport for MemoryTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn output_frame_or_drop(&mut self, frame: Bytes) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            state.frames.push_back(frame);
        }
    }

    fn close(&mut self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
    }
}

impl MemoryPeer {
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Frames written so far, oldest first.
    pub fn take_frames(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frames
            .drain(..)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }
}
