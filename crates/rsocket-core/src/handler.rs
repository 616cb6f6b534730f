//! Application-facing callbacks: responders, subscribers, observers and hooks.

use std::sync::mpsc;

use bytes::Bytes;
use rsocket_frame::{FrameType, Payload, StreamId};
use tracing::debug;

use crate::command::StreamHandle;
use crate::error::{RSocketError, StreamCompletionSignal, StreamError};
use crate::streams::StreamType;

/// Receives the items of a stream or channel.
///
/// After `on_complete` or `on_error` no further calls are made.
pub trait Subscriber: Send {
    fn on_next(&mut self, payload: Payload);
    fn on_complete(&mut self);
    fn on_error(&mut self, error: StreamError);
}

/// Receives the single result of a request-response.
pub trait SingleObserver: Send {
    fn on_success(&mut self, payload: Payload);
    fn on_error(&mut self, error: StreamError);
}

/// Serves requests opened by the peer.
///
/// Responses are produced through the [`StreamHandle`], from any thread.
pub trait RequestHandler: Send {
    fn handle_fire_and_forget(&mut self, request: Payload, stream_id: StreamId) {
        debug!(stream_id, len = request.len(), "fire-and-forget dropped by default handler");
    }

    fn handle_request_response(&mut self, request: Payload, response: StreamHandle) {
        let _ = request;
        response.error(StreamError::Rejected("request-response is not supported".to_string()));
    }

    fn handle_request_stream(&mut self, request: Payload, response: StreamHandle) {
        let _ = request;
        response.error(StreamError::Rejected("request-stream is not supported".to_string()));
    }

    /// Returns the subscriber for the items the requester sends.
    fn handle_request_channel(&mut self, request: Payload, response: StreamHandle) -> Box<dyn Subscriber> {
        let _ = request;
        response.error(StreamError::Rejected("request-channel is not supported".to_string()));
        Box::new(NoopSubscriber)
    }

    fn handle_metadata_push(&mut self, metadata: Bytes) {
        debug!(len = metadata.len(), "metadata push dropped by default handler");
    }
}

/// Handler that rejects every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingHandler;

impl RequestHandler for RejectingHandler {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscriber;

impl Subscriber for NoopSubscriber {
    fn on_next(&mut self, _payload: Payload) {}
    fn on_complete(&mut self) {}
    fn on_error(&mut self, _error: StreamError) {}
}

/// Connection lifecycle notifications.
pub trait ConnectionEvents: Send {
    fn on_connected(&mut self) {}
    fn on_disconnected(&mut self, _reason: &str) {}
    fn on_closed(&mut self, _reason: &str) {}
    fn on_streams_paused(&mut self) {}
    fn on_streams_resumed(&mut self) {}
}

/// Counters hook. All methods default to no-ops.
pub trait RSocketStats: Send + Sync {
    fn frame_read(&self, _frame_type: FrameType) {}
    fn frame_written(&self, _frame_type: FrameType) {}
    fn socket_connected(&self) {}
    fn socket_disconnected(&self) {}
    fn socket_closed(&self, _signal: StreamCompletionSignal) {}
    fn stream_opened(&self, _stream_type: StreamType) {}
    fn stream_closed(&self) {}
    fn keepalive_sent(&self) {}
    fn keepalive_received(&self) {}
    fn resume_succeeded(&self) {}
    fn resume_failed(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl RSocketStats for NoopStats {}

/// Rebuilds locally requested streams after a cold resume.
pub trait ColdResumeHandler: Send {
    /// Token persisted with a new stream so it can be recognized later.
    fn generate_stream_token(&mut self, payload: &Payload, stream_id: StreamId, stream_type: StreamType) -> String {
        let _ = (payload, stream_type);
        stream_id.to_string()
    }

    /// Subscriber for a resumed request-stream, `None` to cancel it.
    fn handle_requester_resume_stream(&mut self, token: &str, consumer_allowance: u32) -> Option<Box<dyn Subscriber>>;
}

/// Outcome of a client-side resume attempt.
pub trait ResumeStatusCallback: Send {
    fn on_resume_ok(&mut self);
    fn on_resume_error(&mut self, error: RSocketError);
}

/// Item seen by a channel-backed subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    Next(Payload),
    Complete,
    Error(StreamError),
}

struct ChannelSubscriber(mpsc::Sender<SubscriberEvent>);

impl Subscriber for ChannelSubscriber {
    fn on_next(&mut self, payload: Payload) {
        let _ = self.0.send(SubscriberEvent::Next(payload));
    }

    fn on_complete(&mut self) {
        let _ = self.0.send(SubscriberEvent::Complete);
    }

    fn on_error(&mut self, error: StreamError) {
        let _ = self.0.send(SubscriberEvent::Error(error));
    }
}

/// Subscriber that forwards every signal to a channel.
pub fn subscriber_channel() -> (Box<dyn Subscriber>, mpsc::Receiver<SubscriberEvent>) {
    let (tx, rx) = mpsc::channel();
    (Box::new(ChannelSubscriber(tx)), rx)
}

struct ChannelObserver(mpsc::Sender<std::result::Result<Payload, StreamError>>);

impl SingleObserver for ChannelObserver {
    fn on_success(&mut self, payload: Payload) {
        let _ = self.0.send(Ok(payload));
    }

    fn on_error(&mut self, error: StreamError) {
        let _ = self.0.send(Err(error));
    }
}

/// Observer that forwards its result to a channel.
pub fn single_channel() -> (
    Box<dyn SingleObserver>,
    mpsc::Receiver<std::result::Result<Payload, StreamError>>,
) {
    let (tx, rx) = mpsc::channel();
    (Box::new(ChannelObserver(tx)), rx)
}

struct ChannelResumeStatus(mpsc::Sender<std::result::Result<(), String>>);

impl ResumeStatusCallback for ChannelResumeStatus {
    fn on_resume_ok(&mut self) {
        let _ = self.0.send(Ok(()));
    }

    fn on_resume_error(&mut self, error: RSocketError) {
        let _ = self.0.send(Err(error.to_string()));
    }
}

/// Resume callback that reports its outcome on a channel.
pub fn resume_status_channel() -> (
    Box<dyn ResumeStatusCallback>,
    mpsc::Receiver<std::result::Result<(), String>>,
) {
    let (tx, rx) = mpsc::channel();
    (Box::new(ChannelResumeStatus(tx)), rx)
}
