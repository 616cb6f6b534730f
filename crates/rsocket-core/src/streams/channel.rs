use rsocket_frame::{FrameFlags, Payload, StreamId};
use tracing::debug;

use super::flow::{Consumer, Delivery, Publisher};
use super::fragments::FragmentAccumulator;
use super::{StreamBase, StreamHandler, StreamType, StreamsWriter};
use crate::command::StreamSignal;
use crate::error::{StreamCompletionSignal, StreamError};
use crate::handler::Subscriber;

/// Both directions of a channel. A cancel or error on either side ends both.
struct Duplex {
    consumer: Consumer,
    publisher: Publisher,
}

impl Duplex {
    fn new(credits: u32) -> Self {
        Self {
            consumer: Consumer::default(),
            publisher: Publisher::with_credits(credits),
        }
    }

    fn is_done(&self) -> bool {
        self.consumer.is_done() && self.publisher.is_done()
    }

    fn handle_payload(&mut self, w: &mut dyn StreamsWriter, stream_id: StreamId, payload: Payload, flags: FrameFlags) {
        if self.consumer.handle_payload(w, stream_id, payload, flags) == Delivery::Violated {
            self.publisher.cancel();
        }
    }

    fn handle_cancel(&mut self) {
        self.publisher.cancel();
        self.consumer
            .error(StreamError::Canceled("channel canceled by peer".to_string()));
    }

    fn handle_error(&mut self, error: StreamError) {
        self.publisher.cancel();
        self.consumer.error(error);
    }

    fn handle_signal(&mut self, w: &mut dyn StreamsWriter, stream_id: StreamId, signal: StreamSignal) {
        match signal {
            StreamSignal::Next(payload) => self.publisher.next(w, stream_id, payload),
            StreamSignal::Success(payload) => self.publisher.success(w, stream_id, payload),
            StreamSignal::Complete => self.publisher.complete(w, stream_id),
            StreamSignal::Error(error) => {
                self.publisher.error(w, stream_id, &error);
                self.consumer.cancel();
            }
            StreamSignal::Request(n) => {
                if !self.consumer.is_done() && n > 0 {
                    self.consumer.add_allowance(n);
                    w.write_request_n(stream_id, n);
                }
            }
            StreamSignal::Cancel => {
                if !self.is_done() {
                    w.write_cancel(stream_id);
                }
                self.consumer.cancel();
                self.publisher.cancel();
            }
        }
    }

    fn end(&mut self, signal: StreamCompletionSignal) {
        self.publisher.cancel();
        self.consumer.end(signal);
    }
}

/// Local side of a request-channel. The first outbound item travels in the
/// REQUEST_CHANNEL frame.
pub(crate) struct ChannelRequester {
    base: StreamBase,
    initial: Option<Payload>,
    duplex: Duplex,
    closed: bool,
}

impl ChannelRequester {
    pub(crate) fn new(stream_id: StreamId, payload: Payload) -> Self {
        Self {
            base: StreamBase::new(stream_id),
            initial: Some(payload),
            duplex: Duplex::new(0),
            closed: false,
        }
    }

    pub(crate) fn subscribe(&mut self, w: &mut dyn StreamsWriter, subscriber: Box<dyn Subscriber>, initial_request_n: u32) {
        let Some(payload) = self.initial.take() else {
            debug!(stream_id = self.base.stream_id, "channel already requested");
            return;
        };
        self.duplex.consumer.subscribe(subscriber);
        self.duplex.consumer.add_allowance(initial_request_n);
        w.write_new_stream(self.base.stream_id, StreamType::Channel, initial_request_n, payload);
    }

    fn settle(&mut self) {
        if self.duplex.is_done() {
            self.closed = true;
        }
    }
}

impl StreamHandler for ChannelRequester {
    fn base(&self) -> &StreamBase {
        &self.base
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Channel
    }

    fn handle_payload(&mut self, w: &mut dyn StreamsWriter, payload: Payload, flags: FrameFlags) {
        if self.closed {
            return;
        }
        self.duplex.handle_payload(w, self.base.stream_id, payload, flags);
        self.settle();
    }

    fn handle_request_n(&mut self, w: &mut dyn StreamsWriter, n: u32) {
        if self.closed {
            return;
        }
        self.duplex.publisher.request(w, self.base.stream_id, n);
        self.settle();
    }

    fn handle_cancel(&mut self, _w: &mut dyn StreamsWriter) {
        self.duplex.handle_cancel();
        self.closed = true;
    }

    fn handle_error(&mut self, _w: &mut dyn StreamsWriter, error: StreamError) {
        self.duplex.handle_error(error);
        self.closed = true;
    }

    fn handle_signal(&mut self, w: &mut dyn StreamsWriter, signal: StreamSignal) {
        if self.closed {
            return;
        }
        self.duplex.handle_signal(w, self.base.stream_id, signal);
        self.settle();
    }

    fn end_stream(&mut self, signal: StreamCompletionSignal) {
        self.duplex.end(signal);
        self.closed = true;
    }

    fn consumer_allowance(&self) -> u32 {
        self.duplex.consumer.allowance()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponderState {
    New,
    Open,
    Closed,
}

/// Remote side of a request-channel.
pub(crate) struct ChannelResponder {
    base: StreamBase,
    state: ResponderState,
    fragments: FragmentAccumulator,
    duplex: Duplex,
}

impl ChannelResponder {
    pub(crate) fn new(stream_id: StreamId) -> Self {
        Self {
            base: StreamBase::new(stream_id),
            state: ResponderState::New,
            fragments: FragmentAccumulator::default(),
            duplex: Duplex::new(0),
        }
    }

    fn settle(&mut self) {
        if self.duplex.is_done() {
            self.state = ResponderState::Closed;
        }
    }
}

impl StreamHandler for ChannelResponder {
    fn base(&self) -> &StreamBase {
        &self.base
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Channel
    }

    fn handle_request(&mut self, w: &mut dyn StreamsWriter, initial_request_n: u32, payload: Payload, flags: FrameFlags) {
        self.duplex.publisher = Publisher::with_credits(initial_request_n);
        self.handle_payload(w, payload, flags);
    }

    fn handle_payload(&mut self, w: &mut dyn StreamsWriter, payload: Payload, flags: FrameFlags) {
        match self.state {
            ResponderState::Closed => {}
            ResponderState::Open => {
                self.duplex.handle_payload(w, self.base.stream_id, payload, flags);
                self.settle();
            }
            ResponderState::New => {
                self.fragments.add(payload, flags);
                if flags.contains(FrameFlags::FOLLOWS) {
                    return;
                }
                let (payload, flags) = self.fragments.consume();
                self.state = ResponderState::Open;
                if let Some(subscriber) =
                    w.on_new_stream_ready(self.base.stream_id, StreamType::Channel, payload, self.base.cancel_flag())
                {
                    self.duplex.consumer.subscribe(subscriber);
                }
                if flags.contains(FrameFlags::COMPLETE) {
                    self.duplex.consumer.complete();
                }
                self.settle();
            }
        }
    }

    fn handle_request_n(&mut self, w: &mut dyn StreamsWriter, n: u32) {
        if self.state == ResponderState::Closed {
            return;
        }
        self.duplex.publisher.request(w, self.base.stream_id, n);
        self.settle();
    }

    fn handle_cancel(&mut self, _w: &mut dyn StreamsWriter) {
        self.duplex.handle_cancel();
        self.state = ResponderState::Closed;
    }

    fn handle_error(&mut self, _w: &mut dyn StreamsWriter, error: StreamError) {
        self.duplex.handle_error(error);
        self.state = ResponderState::Closed;
    }

    fn handle_signal(&mut self, w: &mut dyn StreamsWriter, signal: StreamSignal) {
        if self.state != ResponderState::Open {
            return;
        }
        self.duplex.handle_signal(w, self.base.stream_id, signal);
        self.settle();
    }

    fn end_stream(&mut self, signal: StreamCompletionSignal) {
        self.duplex.end(signal);
        self.state = ResponderState::Closed;
    }

    fn consumer_allowance(&self) -> u32 {
        self.duplex.consumer.allowance()
    }

    fn is_closed(&self) -> bool {
        self.state == ResponderState::Closed
    }
}
