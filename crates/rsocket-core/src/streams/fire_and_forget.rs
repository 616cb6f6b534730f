use rsocket_frame::{FrameFlags, Payload};
use tracing::trace;

use super::fragments::FragmentAccumulator;
use super::{StreamBase, StreamHandler, StreamType, StreamsWriter};
use crate::command::StreamSignal;
use crate::error::{StreamCompletionSignal, StreamError};

/// Receives a fire-and-forget request, possibly fragmented, then closes.
pub(crate) struct FireAndForgetResponder {
    base: StreamBase,
    fragments: FragmentAccumulator,
    closed: bool,
}

impl FireAndForgetResponder {
    pub(crate) fn new(stream_id: rsocket_frame::StreamId) -> Self {
        Self {
            base: StreamBase::new(stream_id),
            fragments: FragmentAccumulator::default(),
            closed: false,
        }
    }
}

impl StreamHandler for FireAndForgetResponder {
    fn base(&self) -> &StreamBase {
        &self.base
    }

    fn stream_type(&self) -> StreamType {
        StreamType::FireAndForget
    }

    fn handle_payload(&mut self, w: &mut dyn StreamsWriter, payload: Payload, flags: FrameFlags) {
        if self.closed {
            return;
        }
        self.fragments.add(payload, flags);
        if flags.contains(FrameFlags::FOLLOWS) {
            return;
        }
        let (payload, _) = self.fragments.consume();
        self.closed = true;
        w.on_new_stream_ready(
            self.base.stream_id,
            StreamType::FireAndForget,
            payload,
            self.base.cancel_flag(),
        );
    }

    fn handle_cancel(&mut self, _w: &mut dyn StreamsWriter) {
        trace!(stream_id = self.base.stream_id, "fire-and-forget canceled before completion");
        self.closed = true;
    }

    fn handle_error(&mut self, _w: &mut dyn StreamsWriter, _error: StreamError) {
        self.closed = true;
    }

    fn handle_signal(&mut self, _w: &mut dyn StreamsWriter, _signal: StreamSignal) {}

    fn end_stream(&mut self, _signal: StreamCompletionSignal) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{RecordingWriter, Written};
    use super::*;

    #[test]
    fn delivers_reassembled_request_once() {
        let mut w = RecordingWriter::default();
        let mut stream = FireAndForgetResponder::new(1);
        stream.handle_request(&mut w, 0, Payload::from("he"), FrameFlags::FOLLOWS);
        assert!(w.written.is_empty());
        assert!(!stream.is_closed());

        stream.handle_payload(&mut w, Payload::from("llo"), FrameFlags::empty());
        assert_eq!(
            w.take(),
            vec![Written::Ready(1, StreamType::FireAndForget, Payload::from("hello"))]
        );
        assert!(stream.is_closed());
    }
}
