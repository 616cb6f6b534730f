//! The RSocket connection engine.
//!
//! One [`RSocketStateMachine`] owns a connection: it multiplexes streams over
//! a single transport, enforces per-stream flow control, runs keepalive and
//! keeps the resume ledger so a session can survive a dropped transport.
//! [`RSocketClient`] and [`RSocketServer`] drive it from threads over a
//! socket; tests and embedders can drive it directly.

pub mod acceptor;
pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod keepalive;
pub mod params;
pub mod registry;
pub mod resume;
pub mod server;
pub mod stream_id;
mod streams;
pub mod transport;

pub use acceptor::{AcceptorConfig, Handshake, SetupResumeAcceptor};
pub use client::{split_stream, RSocketClient};
pub use command::{mailbox, Command, Inbox, Mailbox, OutboundRequest, StreamHandle, StreamSignal, TransportId};
pub use connection::{ConnectionState, RSocketStateMachine};
pub use error::{RSocketError, Result, StreamCompletionSignal, StreamError};
pub use event_loop::{spawn_reader, ConnectionHandle, EventLoop};
pub use handler::{
    resume_status_channel, single_channel, subscriber_channel, ColdResumeHandler, ConnectionEvents, NoopStats,
    NoopSubscriber, RSocketStats, RejectingHandler, RequestHandler, ResumeStatusCallback, SingleObserver,
    Subscriber, SubscriberEvent,
};
pub use keepalive::{KeepaliveTick, KeepaliveTimer};
pub use params::{
    ConnectionConfig, ConnectionRole, ResumeParameters, SetupParameters, DEFAULT_KEEPALIVE_INTERVAL,
    DEFAULT_MAX_FRAGMENT_SIZE, DEFAULT_MAX_LIFETIME, DEFAULT_MIME_TYPE, DEFAULT_RESUME_BUFFER_CAPACITY,
};
pub use registry::{lock_connection, ConnectionId, ConnectionRegistry, SharedConnection};
pub use resume::{
    is_tracked_frame, RequestOrigin, ResumeManager, ResumeSnapshot, SnapshotFrame, StreamResumeInfo,
    WarmResumeManager,
};
pub use server::{AcceptOutcome, RSocketServer};
pub use stream_id::{PeerStreamIdError, StreamIdAllocator, MAX_STREAM_ID};
pub use streams::StreamType;
pub use transport::{FrameTransport, MemoryPeer, MemoryTransport, SocketTransport};

pub use rsocket_frame::{ErrorCode, Payload, ProtocolVersion, ResumeToken, StreamId};
