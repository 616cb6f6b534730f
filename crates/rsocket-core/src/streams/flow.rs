//! Request-n accounting shared by the streaming interactions.

use std::collections::VecDeque;

use rsocket_frame::{ErrorFrame, FrameFlags, Payload, StreamId};
use tracing::debug;

use super::fragments::FragmentAccumulator;
use super::StreamsWriter;
use crate::error::{StreamCompletionSignal, StreamError};
use crate::handler::Subscriber;

/// Request-n value meaning "unbounded".
pub(crate) const MAX_REQUEST_N: u32 = i32::MAX as u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Allowance(u32);

impl Allowance {
    pub(crate) fn new(n: u32) -> Self {
        Self(n.min(MAX_REQUEST_N))
    }

    pub(crate) fn add(&mut self, n: u32) {
        self.0 = self.0.saturating_add(n).min(MAX_REQUEST_N);
    }

    pub(crate) fn try_consume(&mut self) -> bool {
        match self.0 {
            0 => false,
            MAX_REQUEST_N => true,
            _ => {
                self.0 -= 1;
                true
            }
        }
    }

    pub(crate) fn get(self) -> u32 {
        self.0
    }
}

/// Outcome of feeding one inbound PAYLOAD to a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Waiting for more fragments, or an item was delivered.
    Continue,
    Completed,
    /// The producer broke flow control or the frame sequence.
    Violated,
}

/// Inbound half of a stream or channel.
#[derive(Default)]
pub(crate) struct Consumer {
    allowance: Allowance,
    subscriber: Option<Box<dyn Subscriber>>,
    fragments: FragmentAccumulator,
    done: bool,
}

impl Consumer {
    pub(crate) fn with_allowance(allowance: u32) -> Self {
        Self {
            allowance: Allowance::new(allowance),
            ..Self::default()
        }
    }

    pub(crate) fn subscribe(&mut self, subscriber: Box<dyn Subscriber>) {
        self.subscriber = Some(subscriber);
    }

    pub(crate) fn add_allowance(&mut self, n: u32) {
        self.allowance.add(n);
    }

    pub(crate) fn allowance(&self) -> u32 {
        if self.done {
            0
        } else {
            self.allowance.get()
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn handle_payload(
        &mut self,
        w: &mut dyn StreamsWriter,
        stream_id: StreamId,
        payload: Payload,
        flags: FrameFlags,
    ) -> Delivery {
        if self.done {
            return Delivery::Completed;
        }
        self.fragments.add(payload, flags);
        if flags.contains(FrameFlags::FOLLOWS) {
            return Delivery::Continue;
        }
        let (payload, flags) = self.fragments.consume();
        let next = flags.contains(FrameFlags::NEXT);
        let complete = flags.contains(FrameFlags::COMPLETE);

        if !next && !complete {
            let message = "payload without NEXT or COMPLETE";
            self.error(StreamError::Protocol(message.to_string()));
            w.write_error(ErrorFrame::invalid(stream_id, message));
            return Delivery::Violated;
        }
        if next {
            if !self.allowance.try_consume() {
                debug!(stream_id, "producer exceeded requested items");
                let message = "received more items than requested";
                self.error(StreamError::FlowControl(message.to_string()));
                w.write_error(ErrorFrame::invalid(stream_id, message));
                return Delivery::Violated;
            }
            if let Some(subscriber) = self.subscriber.as_mut() {
                subscriber.on_next(payload);
            }
        }
        if complete {
            self.complete();
            return Delivery::Completed;
        }
        Delivery::Continue
    }

    pub(crate) fn complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.on_complete();
        }
    }

    pub(crate) fn error(&mut self, error: StreamError) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.on_error(error);
        }
    }

    /// Stop delivering without telling the subscriber.
    pub(crate) fn cancel(&mut self) {
        self.done = true;
        self.subscriber = None;
    }

    pub(crate) fn end(&mut self, signal: StreamCompletionSignal) {
        match signal {
            StreamCompletionSignal::Complete => self.complete(),
            StreamCompletionSignal::Cancel => self.cancel(),
            other => self.error(StreamError::Interrupted(other)),
        }
    }
}

/// Outbound half of a stream or channel.
///
/// Items beyond the peer's credit wait in order until REQUEST_N arrives.
#[derive(Debug, Default)]
pub(crate) struct Publisher {
    credits: Allowance,
    queue: VecDeque<Payload>,
    complete_pending: bool,
    done: bool,
}

impl Publisher {
    pub(crate) fn with_credits(credits: u32) -> Self {
        Self {
            credits: Allowance::new(credits),
            ..Self::default()
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn next(&mut self, w: &mut dyn StreamsWriter, stream_id: StreamId, payload: Payload) {
        if self.done || self.complete_pending {
            return;
        }
        if self.queue.is_empty() && self.credits.try_consume() {
            w.write_payload(stream_id, payload, FrameFlags::NEXT);
        } else {
            self.queue.push_back(payload);
        }
    }

    /// Last item followed by completion.
    pub(crate) fn success(&mut self, w: &mut dyn StreamsWriter, stream_id: StreamId, payload: Payload) {
        if self.done || self.complete_pending {
            return;
        }
        if self.queue.is_empty() && self.credits.try_consume() {
            w.write_payload(stream_id, payload, FrameFlags::NEXT | FrameFlags::COMPLETE);
            self.done = true;
        } else {
            self.queue.push_back(payload);
            self.complete_pending = true;
        }
    }

    pub(crate) fn complete(&mut self, w: &mut dyn StreamsWriter, stream_id: StreamId) {
        if self.done {
            return;
        }
        self.complete_pending = true;
        self.drain(w, stream_id);
    }

    pub(crate) fn request(&mut self, w: &mut dyn StreamsWriter, stream_id: StreamId, n: u32) {
        if self.done {
            return;
        }
        self.credits.add(n);
        self.drain(w, stream_id);
    }

    pub(crate) fn error(&mut self, w: &mut dyn StreamsWriter, stream_id: StreamId, error: &StreamError) {
        if self.done {
            return;
        }
        self.cancel();
        w.write_error(error.to_error_frame(stream_id));
    }

    /// Drop queued items; nothing more is sent.
    pub(crate) fn cancel(&mut self) {
        self.done = true;
        self.queue.clear();
    }

    fn drain(&mut self, w: &mut dyn StreamsWriter, stream_id: StreamId) {
        while !self.queue.is_empty() && self.credits.try_consume() {
            let Some(payload) = self.queue.pop_front() else {
                break;
            };
            if self.queue.is_empty() && self.complete_pending {
                w.write_payload(stream_id, payload, FrameFlags::NEXT | FrameFlags::COMPLETE);
                self.done = true;
                return;
            }
            w.write_payload(stream_id, payload, FrameFlags::NEXT);
        }
        if self.queue.is_empty() && self.complete_pending {
            w.write_payload(stream_id, Payload::default(), FrameFlags::COMPLETE);
            self.done = true;
        }
    }
}
