//! Messages posted to a connection from other threads.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rsocket_frame::{Payload, StreamId};

use crate::error::{StreamCompletionSignal, StreamError};
use crate::handler::{ResumeStatusCallback, SingleObserver, Subscriber};
use crate::params::ResumeParameters;
use crate::transport::FrameTransport;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one attached transport so frames from a replaced one can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

impl TransportId {
    pub fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Application-side signal for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Next(Payload),
    /// Final item, sent as NEXT|COMPLETE.
    Success(Payload),
    Complete,
    Error(StreamError),
    /// Ask the producer for more items.
    Request(u32),
    Cancel,
}

/// A request to open, built off the connection thread.
pub enum OutboundRequest {
    FireAndForget(Payload),
    MetadataPush(Bytes),
    RequestResponse {
        payload: Payload,
        observer: Box<dyn SingleObserver>,
    },
    RequestStream {
        payload: Payload,
        initial_request_n: u32,
        subscriber: Box<dyn Subscriber>,
    },
    RequestChannel {
        payload: Payload,
        initial_request_n: u32,
        subscriber: Box<dyn Subscriber>,
    },
}

pub enum Command {
    /// A complete frame read from the given transport.
    Inbound { transport: TransportId, frame: Bytes },
    /// The transport's reader hit end of stream or an error.
    TransportClosed {
        transport: TransportId,
        error: Option<String>,
    },
    Signal { stream_id: StreamId, signal: StreamSignal },
    Request {
        request: OutboundRequest,
        reply: Option<mpsc::Sender<Option<StreamHandle>>>,
    },
    ResumeServer {
        transport: Box<dyn FrameTransport>,
        params: ResumeParameters,
    },
    ResumeClient {
        transport: Box<dyn FrameTransport>,
        token: rsocket_frame::ResumeToken,
        callback: Box<dyn ResumeStatusCallback>,
    },
    Disconnect { reason: String },
    Close {
        reason: String,
        signal: StreamCompletionSignal,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound { transport, frame } => write!(f, "Inbound({transport}, {} bytes)", frame.len()),
            Self::TransportClosed { transport, error } => write!(f, "TransportClosed({transport}, {error:?})"),
            Self::Signal { stream_id, signal } => write!(f, "Signal({stream_id}, {signal:?})"),
            Self::Request { .. } => f.write_str("Request"),
            Self::ResumeServer { params, .. } => write!(f, "ResumeServer({params:?})"),
            Self::ResumeClient { .. } => f.write_str("ResumeClient"),
            Self::Disconnect { reason } => write!(f, "Disconnect({reason})"),
            Self::Close { reason, signal } => write!(f, "Close({reason}, {signal})"),
        }
    }
}

/// Sending half of a connection's command queue.
#[derive(Debug, Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Command>,
}

impl Mailbox {
    /// Queue a command; `false` once the connection is gone.
    pub fn post(&self, command: Command) -> bool {
        self.sender.send(command).is_ok()
    }
}

/// Receiving half, owned by whoever drives the connection.
#[derive(Debug)]
pub struct Inbox {
    receiver: mpsc::Receiver<Command>,
}

impl Inbox {
    pub fn try_recv(&self) -> Option<Command> {
        self.receiver.try_recv().ok()
    }

    /// Wait for a command until `deadline`, or forever without one.
    pub fn recv_deadline(&self, deadline: Option<Instant>) -> Result<Command, RecvTimeoutError> {
        match deadline {
            Some(deadline) => self
                .receiver
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => self.receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        }
    }
}

pub fn mailbox() -> (Mailbox, Inbox) {
    let (sender, receiver) = mpsc::channel();
    (Mailbox { sender }, Inbox { receiver })
}

/// Thread-safe handle to one stream.
///
/// Signals are posted to the owning connection and applied in order. Once the
/// stream terminates, further signals are dropped.
#[derive(Clone)]
pub struct StreamHandle {
    stream_id: StreamId,
    mailbox: Mailbox,
    cancelled: Arc<AtomicBool>,
}

impl StreamHandle {
    pub(crate) fn new(stream_id: StreamId, mailbox: Mailbox, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            stream_id,
            mailbox,
            cancelled,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// True once the stream has terminated, e.g. the peer canceled it.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn next(&self, payload: Payload) {
        self.send(StreamSignal::Next(payload));
    }

    pub fn success(&self, payload: Payload) {
        self.send(StreamSignal::Success(payload));
    }

    pub fn complete(&self) {
        self.send(StreamSignal::Complete);
    }

    pub fn error(&self, error: StreamError) {
        self.send(StreamSignal::Error(error));
    }

    pub fn request(&self, n: u32) {
        self.send(StreamSignal::Request(n));
    }

    pub fn cancel(&self) {
        self.send(StreamSignal::Cancel);
    }

    fn send(&self, signal: StreamSignal) {
        if self.is_cancelled() {
            return;
        }
        self.mailbox.post(Command::Signal {
            stream_id: self.stream_id,
            signal,
        });
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_posts_until_cancelled() {
        let (mailbox, inbox) = mailbox();
        let flag = Arc::new(AtomicBool::new(false));
        let handle = StreamHandle::new(7, mailbox, Arc::clone(&flag));

        handle.next(Payload::from("a"));
        handle.request(3);
        flag.store(true, Ordering::Release);
        handle.complete();

        let mut seen = Vec::new();
        while let Some(command) = inbox.try_recv() {
            match command {
                Command::Signal { stream_id, signal } => seen.push((stream_id, signal)),
                other => panic!("unexpected command {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![
                (7, StreamSignal::Next(Payload::from("a"))),
                (7, StreamSignal::Request(3)),
            ]
        );
        assert!(handle.is_cancelled());
    }

    #[test]
    fn transport_ids_are_unique() {
        assert_ne!(TransportId::next(), TransportId::next());
    }
}
