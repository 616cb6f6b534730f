//! Per-stream state machines.
//!
//! Every interaction variant implements [`StreamHandler`]; the connection only
//! talks to streams through that trait and writes frames back through
//! [`StreamsWriter`].

mod channel;
mod fire_and_forget;
mod flow;
mod fragments;
mod request_response;
mod stream;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rsocket_frame::{ErrorFrame, FrameFlags, FrameType, Payload, StreamId};
use serde::{Deserialize, Serialize};

use crate::command::StreamSignal;
use crate::error::{StreamCompletionSignal, StreamError};
use crate::handler::Subscriber;

pub(crate) use channel::{ChannelRequester, ChannelResponder};
pub(crate) use fire_and_forget::FireAndForgetResponder;
pub(crate) use flow::MAX_REQUEST_N;
pub(crate) use fragments::split_payload;
pub(crate) use request_response::{RequestResponseRequester, RequestResponseResponder};
pub(crate) use stream::{StreamRequester, StreamResponder};

/// Interaction kind of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    FireAndForget,
    RequestResponse,
    Stream,
    Channel,
}

impl StreamType {
    /// Frame type that opens this kind of stream.
    pub fn request_frame_type(self) -> FrameType {
        match self {
            Self::FireAndForget => FrameType::RequestFnf,
            Self::RequestResponse => FrameType::RequestResponse,
            Self::Stream => FrameType::RequestStream,
            Self::Channel => FrameType::RequestChannel,
        }
    }

    pub fn from_request_frame_type(frame_type: FrameType) -> Option<Self> {
        match frame_type {
            FrameType::RequestFnf => Some(Self::FireAndForget),
            FrameType::RequestResponse => Some(Self::RequestResponse),
            FrameType::RequestStream => Some(Self::Stream),
            FrameType::RequestChannel => Some(Self::Channel),
            _ => None,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FireAndForget => "fire-and-forget",
            Self::RequestResponse => "request-response",
            Self::Stream => "request-stream",
            Self::Channel => "request-channel",
        };
        f.write_str(name)
    }
}

/// How stream state machines reach the connection.
pub(crate) trait StreamsWriter {
    /// Emit the request frame (and continuations) opening a local stream.
    fn write_new_stream(&mut self, stream_id: StreamId, stream_type: StreamType, initial_request_n: u32, payload: Payload);

    /// Emit a PAYLOAD, fragmenting as needed. `flags` holds NEXT and/or COMPLETE.
    fn write_payload(&mut self, stream_id: StreamId, payload: Payload, flags: FrameFlags);

    fn write_request_n(&mut self, stream_id: StreamId, n: u32);

    fn write_cancel(&mut self, stream_id: StreamId);

    fn write_error(&mut self, frame: ErrorFrame);

    /// A peer-opened stream has its full request; hand it to the application.
    ///
    /// Returns the subscriber for inbound channel items.
    fn on_new_stream_ready(
        &mut self,
        stream_id: StreamId,
        stream_type: StreamType,
        payload: Payload,
        cancelled: Arc<AtomicBool>,
    ) -> Option<Box<dyn Subscriber>>;
}

/// State shared by every stream variant.
#[derive(Debug)]
pub(crate) struct StreamBase {
    pub(crate) stream_id: StreamId,
    cancelled: Arc<AtomicBool>,
}

impl StreamBase {
    pub(crate) fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub(crate) fn mark_terminated(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Capabilities every stream state machine offers the connection.
pub(crate) trait StreamHandler {
    fn base(&self) -> &StreamBase;

    fn stream_type(&self) -> StreamType;

    /// The request frame that opened a peer stream.
    fn handle_request(&mut self, w: &mut dyn StreamsWriter, initial_request_n: u32, payload: Payload, flags: FrameFlags) {
        let _ = initial_request_n;
        self.handle_payload(w, payload, flags);
    }

    fn handle_payload(&mut self, w: &mut dyn StreamsWriter, payload: Payload, flags: FrameFlags);

    fn handle_request_n(&mut self, w: &mut dyn StreamsWriter, n: u32) {
        let _ = (w, n);
    }

    fn handle_cancel(&mut self, w: &mut dyn StreamsWriter);

    fn handle_error(&mut self, w: &mut dyn StreamsWriter, error: StreamError);

    /// Signal from the local application through a handle.
    fn handle_signal(&mut self, w: &mut dyn StreamsWriter, signal: StreamSignal);

    /// The connection is ending this stream.
    fn end_stream(&mut self, signal: StreamCompletionSignal);

    /// Items the local consumer still accepts.
    fn consumer_allowance(&self) -> u32 {
        0
    }

    fn is_closed(&self) -> bool;
}

/// All stream variants the connection can hold.
pub(crate) enum StreamStateMachine {
    FireAndForgetResponder(FireAndForgetResponder),
    RequestResponseRequester(RequestResponseRequester),
    RequestResponseResponder(RequestResponseResponder),
    StreamRequester(StreamRequester),
    StreamResponder(StreamResponder),
    ChannelRequester(ChannelRequester),
    ChannelResponder(ChannelResponder),
}

impl StreamStateMachine {
    /// Responder for a request frame opened by the peer.
    pub(crate) fn responder(stream_type: StreamType, stream_id: StreamId) -> Self {
        match stream_type {
            StreamType::FireAndForget => Self::FireAndForgetResponder(FireAndForgetResponder::new(stream_id)),
            StreamType::RequestResponse => Self::RequestResponseResponder(RequestResponseResponder::new(stream_id)),
            StreamType::Stream => Self::StreamResponder(StreamResponder::new(stream_id)),
            StreamType::Channel => Self::ChannelResponder(ChannelResponder::new(stream_id)),
        }
    }

    pub(crate) fn handler(&self) -> &dyn StreamHandler {
        match self {
            Self::FireAndForgetResponder(s) => s,
            Self::RequestResponseRequester(s) => s,
            Self::RequestResponseResponder(s) => s,
            Self::StreamRequester(s) => s,
            Self::StreamResponder(s) => s,
            Self::ChannelRequester(s) => s,
            Self::ChannelResponder(s) => s,
        }
    }

    pub(crate) fn handler_mut(&mut self) -> &mut dyn StreamHandler {
        match self {
            Self::FireAndForgetResponder(s) => s,
            Self::RequestResponseRequester(s) => s,
            Self::RequestResponseResponder(s) => s,
            Self::StreamRequester(s) => s,
            Self::StreamResponder(s) => s,
            Self::ChannelRequester(s) => s,
            Self::ChannelResponder(s) => s,
        }
    }
}
