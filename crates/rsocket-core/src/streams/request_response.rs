use rsocket_frame::{FrameFlags, Payload, StreamId};
use tracing::debug;

use super::fragments::FragmentAccumulator;
use super::{StreamBase, StreamHandler, StreamType, StreamsWriter};
use crate::command::StreamSignal;
use crate::error::{StreamCompletionSignal, StreamError};
use crate::handler::SingleObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequesterState {
    New,
    Requested,
    Closed,
}

/// Local side of a request-response.
pub(crate) struct RequestResponseRequester {
    base: StreamBase,
    state: RequesterState,
    initial: Option<Payload>,
    observer: Option<Box<dyn SingleObserver>>,
    fragments: FragmentAccumulator,
}

impl RequestResponseRequester {
    pub(crate) fn new(stream_id: StreamId, payload: Payload) -> Self {
        Self {
            base: StreamBase::new(stream_id),
            state: RequesterState::New,
            initial: Some(payload),
            observer: None,
            fragments: FragmentAccumulator::default(),
        }
    }

    /// Attach the observer and send the request. Only the first subscriber wins.
    pub(crate) fn subscribe(&mut self, w: &mut dyn StreamsWriter, mut observer: Box<dyn SingleObserver>) {
        if self.state != RequesterState::New {
            observer.on_error(StreamError::Invalid(
                "request-response already has a subscriber".to_string(),
            ));
            return;
        }
        self.state = RequesterState::Requested;
        self.observer = Some(observer);
        let payload = self.initial.take().unwrap_or_default();
        w.write_new_stream(self.base.stream_id, StreamType::RequestResponse, 0, payload);
    }
}

impl StreamHandler for RequestResponseRequester {
    fn base(&self) -> &StreamBase {
        &self.base
    }

    fn stream_type(&self) -> StreamType {
        StreamType::RequestResponse
    }

    fn handle_payload(&mut self, _w: &mut dyn StreamsWriter, payload: Payload, flags: FrameFlags) {
        if self.state != RequesterState::Requested {
            return;
        }
        self.fragments.add(payload, flags);
        if flags.contains(FrameFlags::FOLLOWS) {
            return;
        }
        let (payload, flags) = self.fragments.consume();
        self.state = RequesterState::Closed;
        let Some(mut observer) = self.observer.take() else {
            return;
        };
        if flags.intersects(FrameFlags::NEXT | FrameFlags::COMPLETE) {
            observer.on_success(payload);
        } else {
            observer.on_error(StreamError::Protocol(
                "response without NEXT or COMPLETE".to_string(),
            ));
        }
    }

    fn handle_cancel(&mut self, _w: &mut dyn StreamsWriter) {
        debug!(stream_id = self.base.stream_id, "ignoring CANCEL sent to a requester");
    }

    fn handle_error(&mut self, _w: &mut dyn StreamsWriter, error: StreamError) {
        self.state = RequesterState::Closed;
        if let Some(mut observer) = self.observer.take() {
            observer.on_error(error);
        }
    }

    fn handle_signal(&mut self, w: &mut dyn StreamsWriter, signal: StreamSignal) {
        if signal != StreamSignal::Cancel {
            return;
        }
        if self.state == RequesterState::Requested {
            w.write_cancel(self.base.stream_id);
        }
        self.state = RequesterState::Closed;
        self.observer = None;
    }

    fn end_stream(&mut self, signal: StreamCompletionSignal) {
        self.state = RequesterState::Closed;
        if let Some(mut observer) = self.observer.take() {
            if signal != StreamCompletionSignal::Cancel {
                observer.on_error(StreamError::Interrupted(signal));
            }
        }
    }

    fn consumer_allowance(&self) -> u32 {
        u32::from(self.state == RequesterState::Requested)
    }

    fn is_closed(&self) -> bool {
        self.state == RequesterState::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponderState {
    New,
    Responding,
    Closed,
}

/// Remote side of a request-response.
pub(crate) struct RequestResponseResponder {
    base: StreamBase,
    state: ResponderState,
    fragments: FragmentAccumulator,
}

impl RequestResponseResponder {
    pub(crate) fn new(stream_id: StreamId) -> Self {
        Self {
            base: StreamBase::new(stream_id),
            state: ResponderState::New,
            fragments: FragmentAccumulator::default(),
        }
    }
}

impl StreamHandler for RequestResponseResponder {
    fn base(&self) -> &StreamBase {
        &self.base
    }

    fn stream_type(&self) -> StreamType {
        StreamType::RequestResponse
    }

    fn handle_payload(&mut self, w: &mut dyn StreamsWriter, payload: Payload, flags: FrameFlags) {
        if self.state != ResponderState::New {
            debug!(stream_id = self.base.stream_id, "ignoring extra request-response payload");
            return;
        }
        self.fragments.add(payload, flags);
        if flags.contains(FrameFlags::FOLLOWS) {
            return;
        }
        let (payload, _) = self.fragments.consume();
        self.state = ResponderState::Responding;
        w.on_new_stream_ready(
            self.base.stream_id,
            StreamType::RequestResponse,
            payload,
            self.base.cancel_flag(),
        );
    }

    fn handle_cancel(&mut self, _w: &mut dyn StreamsWriter) {
        self.state = ResponderState::Closed;
    }

    fn handle_error(&mut self, _w: &mut dyn StreamsWriter, _error: StreamError) {
        self.state = ResponderState::Closed;
    }

    fn handle_signal(&mut self, w: &mut dyn StreamsWriter, signal: StreamSignal) {
        if self.state != ResponderState::Responding {
            return;
        }
        let stream_id = self.base.stream_id;
        match signal {
            StreamSignal::Next(payload) | StreamSignal::Success(payload) => {
                w.write_payload(stream_id, payload, FrameFlags::NEXT | FrameFlags::COMPLETE);
            }
            StreamSignal::Complete => {
                w.write_payload(stream_id, Payload::default(), FrameFlags::COMPLETE);
            }
            StreamSignal::Error(error) => w.write_error(error.to_error_frame(stream_id)),
            StreamSignal::Request(_) | StreamSignal::Cancel => return,
        }
        self.state = ResponderState::Closed;
    }

    fn end_stream(&mut self, _signal: StreamCompletionSignal) {
        self.state = ResponderState::Closed;
    }

    fn is_closed(&self) -> bool {
        self.state == ResponderState::Closed
    }
}
