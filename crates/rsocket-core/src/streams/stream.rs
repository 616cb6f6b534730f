use rsocket_frame::{FrameFlags, Payload, StreamId};
use tracing::debug;

use super::flow::{Consumer, Delivery, Publisher};
use super::fragments::FragmentAccumulator;
use super::{StreamBase, StreamHandler, StreamType, StreamsWriter};
use crate::command::StreamSignal;
use crate::error::{StreamCompletionSignal, StreamError};
use crate::handler::Subscriber;

/// Local side of a request-stream.
///
/// REQUEST_STREAM goes out with the first non-zero demand; later demand is
/// sent as REQUEST_N.
pub(crate) struct StreamRequester {
    base: StreamBase,
    initial: Option<Payload>,
    requested: bool,
    consumer: Consumer,
    closed: bool,
}

impl StreamRequester {
    pub(crate) fn new(stream_id: StreamId, payload: Payload) -> Self {
        Self {
            base: StreamBase::new(stream_id),
            initial: Some(payload),
            requested: false,
            consumer: Consumer::default(),
            closed: false,
        }
    }

    /// Rebuild a stream that was already requested before a cold resume.
    pub(crate) fn resumed(stream_id: StreamId, subscriber: Box<dyn Subscriber>, allowance: u32) -> Self {
        let mut consumer = Consumer::with_allowance(allowance);
        consumer.subscribe(subscriber);
        Self {
            base: StreamBase::new(stream_id),
            initial: None,
            requested: true,
            consumer,
            closed: false,
        }
    }

    pub(crate) fn subscribe(&mut self, w: &mut dyn StreamsWriter, subscriber: Box<dyn Subscriber>, initial_request_n: u32) {
        self.consumer.subscribe(subscriber);
        self.request(w, initial_request_n);
    }

    fn request(&mut self, w: &mut dyn StreamsWriter, n: u32) {
        if self.closed || n == 0 {
            return;
        }
        self.consumer.add_allowance(n);
        if self.requested {
            w.write_request_n(self.base.stream_id, n);
        } else {
            self.requested = true;
            let payload = self.initial.take().unwrap_or_default();
            w.write_new_stream(self.base.stream_id, StreamType::Stream, n, payload);
        }
    }
}

impl StreamHandler for StreamRequester {
    fn base(&self) -> &StreamBase {
        &self.base
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Stream
    }

    fn handle_payload(&mut self, w: &mut dyn StreamsWriter, payload: Payload, flags: FrameFlags) {
        if self.closed || !self.requested {
            return;
        }
        match self.consumer.handle_payload(w, self.base.stream_id, payload, flags) {
            Delivery::Continue => {}
            Delivery::Completed | Delivery::Violated => self.closed = true,
        }
    }

    fn handle_cancel(&mut self, _w: &mut dyn StreamsWriter) {
        debug!(stream_id = self.base.stream_id, "ignoring CANCEL sent to a requester");
    }

    fn handle_error(&mut self, _w: &mut dyn StreamsWriter, error: StreamError) {
        self.consumer.error(error);
        self.closed = true;
    }

    fn handle_signal(&mut self, w: &mut dyn StreamsWriter, signal: StreamSignal) {
        match signal {
            StreamSignal::Request(n) => self.request(w, n),
            StreamSignal::Cancel => {
                if self.requested && !self.closed {
                    w.write_cancel(self.base.stream_id);
                }
                self.consumer.cancel();
                self.closed = true;
            }
            other => debug!(stream_id = self.base.stream_id, ?other, "signal not valid for a stream requester"),
        }
    }

    fn end_stream(&mut self, signal: StreamCompletionSignal) {
        self.consumer.end(signal);
        self.closed = true;
    }

    fn consumer_allowance(&self) -> u32 {
        self.consumer.allowance()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponderState {
    New,
    Responding,
    Closed,
}

/// Remote side of a request-stream.
pub(crate) struct StreamResponder {
    base: StreamBase,
    state: ResponderState,
    fragments: FragmentAccumulator,
    publisher: Publisher,
}

impl StreamResponder {
    pub(crate) fn new(stream_id: StreamId) -> Self {
        Self {
            base: StreamBase::new(stream_id),
            state: ResponderState::New,
            fragments: FragmentAccumulator::default(),
            publisher: Publisher::default(),
        }
    }

    fn close_if_done(&mut self) {
        if self.publisher.is_done() {
            self.state = ResponderState::Closed;
        }
    }
}

impl StreamHandler for StreamResponder {
    fn base(&self) -> &StreamBase {
        &self.base
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Stream
    }

    fn handle_request(&mut self, w: &mut dyn StreamsWriter, initial_request_n: u32, payload: Payload, flags: FrameFlags) {
        self.publisher = Publisher::with_credits(initial_request_n);
        self.handle_payload(w, payload, flags);
    }

    fn handle_payload(&mut self, w: &mut dyn StreamsWriter, payload: Payload, flags: FrameFlags) {
        if self.state != ResponderState::New {
            debug!(stream_id = self.base.stream_id, "ignoring payload sent to a stream responder");
            return;
        }
        self.fragments.add(payload, flags);
        if flags.contains(FrameFlags::FOLLOWS) {
            return;
        }
        let (payload, _) = self.fragments.consume();
        self.state = ResponderState::Responding;
        w.on_new_stream_ready(self.base.stream_id, StreamType::Stream, payload, self.base.cancel_flag());
    }

    fn handle_request_n(&mut self, w: &mut dyn StreamsWriter, n: u32) {
        if self.state == ResponderState::Closed {
            return;
        }
        self.publisher.request(w, self.base.stream_id, n);
        self.close_if_done();
    }

    fn handle_cancel(&mut self, _w: &mut dyn StreamsWriter) {
        self.publisher.cancel();
        self.state = ResponderState::Closed;
    }

    fn handle_error(&mut self, _w: &mut dyn StreamsWriter, _error: StreamError) {
        self.publisher.cancel();
        self.state = ResponderState::Closed;
    }

    fn handle_signal(&mut self, w: &mut dyn StreamsWriter, signal: StreamSignal) {
        if self.state != ResponderState::Responding {
            return;
        }
        let stream_id = self.base.stream_id;
        match signal {
            StreamSignal::Next(payload) => self.publisher.next(w, stream_id, payload),
            StreamSignal::Success(payload) => self.publisher.success(w, stream_id, payload),
            StreamSignal::Complete => self.publisher.complete(w, stream_id),
            StreamSignal::Error(error) => self.publisher.error(w, stream_id, &error),
            StreamSignal::Request(_) | StreamSignal::Cancel => {
                debug!(stream_id, "signal not valid for a stream responder");
            }
        }
        self.close_if_done();
    }

    fn end_stream(&mut self, _signal: StreamCompletionSignal) {
        self.publisher.cancel();
        self.state = ResponderState::Closed;
    }

    fn is_closed(&self) -> bool {
        self.state == ResponderState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{next, next_complete, Event, Recorder, RecordingWriter, Written};
    use super::*;

    #[test]
    fn requester_defers_request_until_demand() {
        let recorder = Recorder::default();
        let mut w = RecordingWriter::default();
        let mut stream = StreamRequester::new(1, Payload::from("feed"));
        stream.subscribe(&mut w, recorder.subscriber(), 0);
        assert!(w.take().is_empty());

        stream.handle_signal(&mut w, StreamSignal::Request(2));
        stream.handle_signal(&mut w, StreamSignal::Request(3));
        assert_eq!(
            w.take(),
            vec![
                Written::NewStream(1, StreamType::Stream, 2, Payload::from("feed")),
                Written::RequestN(1, 3),
            ]
        );
        assert_eq!(stream.consumer_allowance(), 5);
    }

    #[test]
    fn requester_reports_flow_control_violation() {
        let recorder = Recorder::default();
        let mut w = RecordingWriter::default();
        let mut stream = StreamRequester::new(1, Payload::default());
        stream.subscribe(&mut w, recorder.subscriber(), 3);
        w.take();

        for item in ["a", "b", "c"] {
            stream.handle_payload(&mut w, Payload::from(item), next());
        }
        assert!(!stream.is_closed());
        stream.handle_payload(&mut w, Payload::from("d"), next());
        assert!(stream.is_closed());

        let events = recorder.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[3], Event::Error(StreamError::FlowControl(_))));
        assert!(matches!(&w.take()[..], [Written::Error(_)]));
    }

    #[test]
    fn requester_cancel_sends_cancel() {
        let recorder = Recorder::default();
        let mut w = RecordingWriter::default();
        let mut stream = StreamRequester::new(1, Payload::default());
        stream.subscribe(&mut w, recorder.subscriber(), 1);
        w.take();
        stream.handle_signal(&mut w, StreamSignal::Cancel);
        assert_eq!(w.take(), vec![Written::Cancel(1)]);
        assert!(stream.is_closed());
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn resumed_requester_keeps_allowance() {
        let recorder = Recorder::default();
        let mut w = RecordingWriter::default();
        let mut stream = StreamRequester::resumed(5, recorder.subscriber(), 1);
        stream.handle_payload(&mut w, Payload::from("x"), next_complete());
        assert_eq!(recorder.events(), vec![Event::Next(Payload::from("x")), Event::Complete]);
        stream.handle_signal(&mut w, StreamSignal::Request(1));
        assert!(w.take().is_empty());
    }

    #[test]
    fn responder_respects_credits() {
        let mut w = RecordingWriter::default();
        let mut stream = StreamResponder::new(2);
        stream.handle_request(&mut w, 1, Payload::from("feed"), FrameFlags::empty());
        assert_eq!(w.take(), vec![Written::Ready(2, StreamType::Stream, Payload::from("feed"))]);

        stream.handle_signal(&mut w, StreamSignal::Next(Payload::from("1")));
        stream.handle_signal(&mut w, StreamSignal::Next(Payload::from("2")));
        stream.handle_signal(&mut w, StreamSignal::Complete);
        assert_eq!(w.take(), vec![Written::Payload(2, Payload::from("1"), next())]);
        assert!(!stream.is_closed());

        stream.handle_request_n(&mut w, 1);
        assert_eq!(w.take(), vec![Written::Payload(2, Payload::from("2"), next_complete())]);
        assert!(stream.is_closed());
    }

    #[test]
    fn responder_shares_cancel_flag_with_handle() {
        let mut w = RecordingWriter::default();
        let mut stream = StreamResponder::new(2);
        stream.handle_request(&mut w, 4, Payload::default(), FrameFlags::empty());
        stream.handle_cancel(&mut w);
        assert!(stream.is_closed());
        stream.base().mark_terminated();
        assert!(w.cancel_flags[0].load(std::sync::atomic::Ordering::Acquire));
    }
}
