//! The per-connection state machine.
//!
//! One [`RSocketStateMachine`] owns a connection's transport, stream table,
//! resume ledger and keepalive timer. It is single-threaded: other threads talk
//! to it by posting [`Command`]s to its mailbox.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rsocket_frame::{
    create_autodetected_serializer, create_frame_serializer, CancelFrame, ErrorCode, ErrorFrame, Frame,
    FrameFlags, FrameSerializer, FrameType, KeepaliveFrame, MetadataPushFrame, Payload, PayloadFrame,
    ProtocolVersion, RequestFrame, RequestNFrame, ResumeFrame, ResumeOkFrame, ResumePosition, ResumeToken,
    StreamId, UNSPECIFIED_RESUME_POSITION,
};
use tracing::{debug, error, info, trace, warn};

use crate::command::{mailbox, Command, Inbox, Mailbox, OutboundRequest, StreamHandle, StreamSignal, TransportId};
use crate::error::{RSocketError, Result, StreamCompletionSignal, StreamError};
use crate::handler::{
    ColdResumeHandler, ConnectionEvents, NoopStats, RSocketStats, RequestHandler, ResumeStatusCallback,
    SingleObserver, Subscriber,
};
use crate::keepalive::{KeepaliveTick, KeepaliveTimer};
use crate::params::{ConnectionConfig, ConnectionRole, ResumeParameters, SetupParameters};
use crate::registry::RegistryLink;
use crate::resume::{RequestOrigin, ResumeManager, ResumeSnapshot, WarmResumeManager};
use crate::stream_id::StreamIdAllocator;
use crate::streams::{
    split_payload, ChannelRequester, RequestResponseRequester, StreamHandler, StreamRequester,
    StreamStateMachine, StreamType, StreamsWriter,
};
use crate::transport::FrameTransport;

/// Coarse connection state, for observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; frames are queued until one is attached.
    Disconnected,
    Connected,
    /// Client sent RESUME and is waiting for RESUME_OK.
    Resuming,
    Closed,
}

pub struct RSocketStateMachine {
    role: ConnectionRole,
    config: ConnectionConfig,
    closed: bool,
    resumable: bool,
    cold_resume_in_progress: bool,
    transport: Option<Box<dyn FrameTransport>>,
    serializer: Option<Box<dyn FrameSerializer>>,
    streams: HashMap<StreamId, StreamStateMachine>,
    stream_ids: StreamIdAllocator,
    pending_output: VecDeque<Bytes>,
    resume_manager: Box<dyn ResumeManager>,
    resume_callback: Option<Box<dyn ResumeStatusCallback>>,
    resume_token: Option<ResumeToken>,
    keepalive: Option<KeepaliveTimer>,
    responder: Box<dyn RequestHandler>,
    cold_resume_handler: Option<Box<dyn ColdResumeHandler>>,
    events: Option<Box<dyn ConnectionEvents>>,
    stats: Arc<dyn RSocketStats>,
    mailbox: Mailbox,
    inbox: Option<Inbox>,
    draining: bool,
    registry_link: Option<RegistryLink>,
}

impl RSocketStateMachine {
    pub fn new(role: ConnectionRole, config: ConnectionConfig, responder: Box<dyn RequestHandler>) -> Self {
        let (mailbox, inbox) = mailbox();
        let resume_manager = Box::new(WarmResumeManager::new(config.resume_buffer_capacity));
        Self {
            role,
            config,
            closed: false,
            resumable: false,
            cold_resume_in_progress: false,
            transport: None,
            serializer: None,
            streams: HashMap::new(),
            stream_ids: StreamIdAllocator::new(role),
            pending_output: VecDeque::new(),
            resume_manager,
            resume_callback: None,
            resume_token: None,
            keepalive: None,
            responder,
            cold_resume_handler: None,
            events: None,
            stats: Arc::new(NoopStats),
            mailbox,
            inbox: Some(inbox),
            draining: false,
            registry_link: None,
        }
    }

    pub fn with_events(mut self, events: Box<dyn ConnectionEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn RSocketStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Replace the ledger, e.g. with one restored from a [`ResumeSnapshot`].
    pub fn with_resume_manager(mut self, resume_manager: Box<dyn ResumeManager>) -> Self {
        self.resume_manager = resume_manager;
        self
    }

    pub fn with_cold_resume_handler(mut self, handler: Box<dyn ColdResumeHandler>) -> Self {
        self.cold_resume_handler = Some(handler);
        self
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::Closed
        } else if self.transport.is_none() {
            ConnectionState::Disconnected
        } else if self.resume_callback.is_some() {
            ConnectionState::Resuming
        } else {
            ConnectionState::Connected
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_disconnected(&self) -> bool {
        self.transport.is_none()
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.serializer.as_ref().map(|s| s.protocol_version())
    }

    /// Token the peer presented in SETUP, for resumable server connections.
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn resume_manager(&self) -> &dyn ResumeManager {
        self.resume_manager.as_ref()
    }

    pub fn resume_snapshot(&self) -> ResumeSnapshot {
        self.resume_manager.snapshot()
    }

    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Take the command queue so an event loop can drive this connection.
    ///
    /// Until then, posted commands are applied at the end of each public call.
    pub fn take_inbox(&mut self) -> Option<Inbox> {
        self.inbox.take()
    }

    pub fn transport_id(&self) -> Option<TransportId> {
        self.transport.as_ref().map(|t| t.id())
    }

    pub(crate) fn attach_registry(&mut self, link: RegistryLink) {
        self.registry_link = Some(link);
    }

    // ---- handshake and transport lifecycle ----

    /// Attach a transport. Queued frames stay queued until the handshake
    /// helpers flush them.
    pub fn connect(&mut self, mut transport: Box<dyn FrameTransport>) -> Result<()> {
        if self.closed {
            transport.close();
            return Err(RSocketError::Closed);
        }
        if self.transport.is_some() {
            transport.close();
            return Err(RSocketError::AlreadyConnected);
        }
        debug!(role = %self.role, transport = %transport.id(), "transport connected");
        self.transport = Some(transport);
        self.stats.socket_connected();
        if let Some(events) = self.events.as_mut() {
            events.on_connected();
        }
        Ok(())
    }

    /// Client handshake: send SETUP, then anything queued.
    pub fn connect_client(&mut self, transport: Box<dyn FrameTransport>, params: SetupParameters) -> Result<()> {
        self.require_role(ConnectionRole::Initiator)?;
        self.set_protocol_version(params.version)?;
        self.resumable = params.resumable;
        let setup = self.serialize(&Frame::Setup(params.to_frame()))?;
        if self.config.send_keepalives {
            self.keepalive = Some(KeepaliveTimer::new(params.keepalive_interval));
        }
        self.connect(transport)?;
        self.output_frame(setup);
        self.send_pending_frames();
        self.drain_inbox();
        Ok(())
    }

    /// Server side of an accepted SETUP.
    pub fn connect_server(&mut self, transport: Box<dyn FrameTransport>, params: &SetupParameters) -> Result<()> {
        self.require_role(ConnectionRole::Acceptor)?;
        self.set_protocol_version(params.version)?;
        self.resumable = params.resumable;
        if params.resumable {
            self.resume_token = Some(params.token.clone());
        }
        self.connect(transport)?;
        self.send_pending_frames();
        self.drain_inbox();
        Ok(())
    }

    /// Continue this session on a new transport after a RESUME.
    ///
    /// Returns whether RESUME_OK was sent; on a position mismatch the
    /// connection is closed with REJECTED_RESUME.
    pub fn resume_server(&mut self, transport: Box<dyn FrameTransport>, params: ResumeParameters) -> Result<bool> {
        self.require_role(ConnectionRole::Acceptor)?;
        if self.closed {
            let mut transport = transport;
            transport.close();
            return Err(RSocketError::Closed);
        }
        self.close_frame_transport("connection being resumed, dropping old transport");
        if let Err(err) = self.set_protocol_version(params.version) {
            let mut transport = transport;
            transport.close();
            return Err(err);
        }
        self.connect(transport)?;
        let resumed = self.resume_from_position_or_close(params.server_position, params.client_position);
        self.drain_inbox();
        Ok(resumed)
    }

    /// Send RESUME on a new transport. The callback hears the outcome.
    ///
    /// Without a negotiated serializer this is a cold resume and needs a
    /// [`ColdResumeHandler`].
    pub fn resume_client(
        &mut self,
        token: ResumeToken,
        transport: Box<dyn FrameTransport>,
        callback: Box<dyn ResumeStatusCallback>,
        version: ProtocolVersion,
    ) -> Result<()> {
        self.require_role(ConnectionRole::Initiator)?;
        if self.closed {
            let mut transport = transport;
            transport.close();
            return Err(RSocketError::Closed);
        }
        if self.serializer.is_none() {
            if self.cold_resume_handler.is_none() {
                return Err(RSocketError::ColdResumeUnavailable);
            }
            self.cold_resume_in_progress = true;
        }
        self.set_protocol_version(version)?;
        let resume = self.serialize(&Frame::Resume(ResumeFrame::new(
            token,
            self.resume_manager.implied_position(),
            self.resume_manager.first_sent_position(),
            version,
        )))?;

        self.disconnect("resuming client on a different transport");
        self.resumable = true;
        if self.keepalive.is_none() && self.config.send_keepalives {
            self.keepalive = Some(KeepaliveTimer::new(crate::params::DEFAULT_KEEPALIVE_INTERVAL));
        }
        self.resume_callback = Some(callback);
        self.connect(transport)?;
        self.output_frame(resume);
        self.drain_inbox();
        Ok(())
    }

    /// The reader side of the transport finished, cleanly (`None`) or not.
    pub fn on_terminal(&mut self, error: Option<String>) {
        let reason = error.clone().unwrap_or_else(|| "transport closed".to_string());
        if self.resumable {
            self.disconnect(&reason);
        } else {
            let signal = if error.is_some() {
                StreamCompletionSignal::ConnectionError
            } else {
                StreamCompletionSignal::ConnectionEnd
            };
            self.close(&reason, signal);
        }
        self.drain_inbox();
    }

    /// Detach the transport but keep streams, for later resumption.
    pub fn disconnect(&mut self, reason: &str) {
        if self.transport.is_none() {
            return;
        }
        info!(role = %self.role, reason, "connection disconnected");
        if let Some(events) = self.events.as_mut() {
            events.on_disconnected(reason);
        }
        self.close_frame_transport(reason);
        self.stats.socket_disconnected();
        if let Some(events) = self.events.as_mut() {
            events.on_streams_paused();
        }
    }

    /// Terminal. Ends every stream with `signal`; later calls do nothing.
    pub fn close(&mut self, reason: &str, signal: StreamCompletionSignal) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(role = %self.role, reason, %signal, "connection closed");
        self.stats.socket_closed(signal);

        if let Some(mut callback) = self.resume_callback.take() {
            callback.on_resume_error(RSocketError::ResumeFailed(reason.to_string()));
        }
        self.close_streams(signal);
        self.close_frame_transport(reason);
        self.pending_output.clear();
        if let Some(mut events) = self.events.take() {
            events.on_closed(reason);
        }
        if let Some(link) = self.registry_link.take() {
            link.release();
        }
    }

    /// Send ERROR on stream 0 (best effort) and close.
    pub fn close_with_error(&mut self, error: ErrorFrame) {
        let signal = StreamCompletionSignal::from_error_code(error.code);
        let reason = error.message();
        warn!(role = %self.role, code = %error.code, reason = %reason, "closing connection with error");
        if self.serializer.is_some() && !self.closed {
            self.output_frame_or_enqueue(Frame::Error(error));
        }
        self.close(&reason, signal);
    }

    /// Resumable connections disconnect, others close with the error.
    pub fn disconnect_or_close_with_error(&mut self, error: ErrorFrame) {
        if self.resumable {
            self.disconnect(&error.message());
        } else {
            self.close_with_error(error);
        }
    }

    // ---- requests ----

    pub fn request_response(&mut self, payload: Payload, mut observer: Box<dyn SingleObserver>) -> Option<StreamHandle> {
        let stream_id = match self.allocate_stream_id() {
            Ok(id) => id,
            Err(err) => {
                observer.on_error(err);
                return None;
            }
        };
        let mut stream = RequestResponseRequester::new(stream_id, payload);
        stream.subscribe(self, observer);
        let handle = StreamHandle::new(stream_id, self.mailbox(), stream.base().cancel_flag());
        self.settle_stream(stream_id, StreamStateMachine::RequestResponseRequester(stream));
        self.drain_inbox();
        Some(handle)
    }

    /// Open a request-stream. With `initial_request_n == 0` nothing is sent
    /// until the handle requests items.
    pub fn request_stream(
        &mut self,
        payload: Payload,
        initial_request_n: u32,
        mut subscriber: Box<dyn Subscriber>,
    ) -> Option<StreamHandle> {
        let stream_id = match self.allocate_stream_id() {
            Ok(id) => id,
            Err(err) => {
                subscriber.on_error(err);
                return None;
            }
        };
        let mut stream = StreamRequester::new(stream_id, payload);
        stream.subscribe(self, subscriber, initial_request_n);
        let handle = StreamHandle::new(stream_id, self.mailbox(), stream.base().cancel_flag());
        self.settle_stream(stream_id, StreamStateMachine::StreamRequester(stream));
        self.drain_inbox();
        Some(handle)
    }

    /// Open a request-channel whose first outbound item is `payload`.
    pub fn request_channel(
        &mut self,
        payload: Payload,
        initial_request_n: u32,
        mut subscriber: Box<dyn Subscriber>,
    ) -> Option<StreamHandle> {
        let stream_id = match self.allocate_stream_id() {
            Ok(id) => id,
            Err(err) => {
                subscriber.on_error(err);
                return None;
            }
        };
        let mut stream = ChannelRequester::new(stream_id, payload);
        stream.subscribe(self, subscriber, initial_request_n);
        let handle = StreamHandle::new(stream_id, self.mailbox(), stream.base().cancel_flag());
        self.settle_stream(stream_id, StreamStateMachine::ChannelRequester(stream));
        self.drain_inbox();
        Some(handle)
    }

    pub fn fire_and_forget(&mut self, payload: Payload) -> Result<()> {
        self.ensure_available()?;
        let stream_id = self.stream_ids.next_stream_id()?;
        self.write_new_stream(stream_id, StreamType::FireAndForget, 0, payload);
        self.drain_inbox();
        Ok(())
    }

    pub fn metadata_push(&mut self, metadata: Bytes) -> Result<()> {
        self.ensure_available()?;
        self.output_frame_or_enqueue(Frame::MetadataPush(MetadataPushFrame::new(metadata)));
        self.drain_inbox();
        Ok(())
    }

    /// Apply an application signal to a stream. Unknown streams are ignored.
    pub fn signal(&mut self, stream_id: StreamId, signal: StreamSignal) {
        self.with_stream(stream_id, |stream, w| stream.handler_mut().handle_signal(w, signal));
        self.drain_inbox();
    }

    // ---- inbound ----

    /// Handle one complete frame from the current transport.
    pub fn process_frame(&mut self, frame: Bytes) {
        if self.closed {
            trace!(len = frame.len(), "dropping frame on closed connection");
            return;
        }
        if !self.ensure_or_autodetect_serializer(&frame) {
            self.close_with_error(ErrorFrame::connection_error("cannot detect protocol version"));
            return;
        }
        let Some(serializer) = self.serializer.as_ref() else {
            return;
        };
        let frame_type = serializer.peek_frame_type(&frame);
        let stream_id = serializer.peek_stream_id(&frame);
        self.stats.frame_read(frame_type);

        let Some(stream_id) = stream_id else {
            self.close_with_error(ErrorFrame::connection_error("cannot decode stream id"));
            return;
        };
        let len = frame.len();
        trace!(%frame_type, stream_id, len, "frame received");

        if stream_id == 0 {
            self.handle_connection_frame(frame_type, frame);
        } else {
            self.handle_stream_frame(stream_id, frame_type, frame);
        }

        let allowance = self.consumer_allowance(stream_id);
        self.resume_manager
            .track_received_frame(len, frame_type, stream_id, allowance);
        self.drain_inbox();
    }

    /// Earliest instant [`handle_timeout`](Self::handle_timeout) has work.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.keepalive.as_ref().and_then(KeepaliveTimer::next_deadline)
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let tick = self.keepalive.as_mut().and_then(|timer| timer.poll(now));
        match tick {
            Some(KeepaliveTick::Send) => {
                self.stats.keepalive_sent();
                self.send_keepalive(true, Bytes::new());
            }
            Some(KeepaliveTick::TimedOut) => {
                self.disconnect_or_close_with_error(ErrorFrame::connection_error("no response to keepalive"));
            }
            None => {}
        }
        self.drain_inbox();
    }

    /// Apply a command posted to the mailbox.
    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Inbound { transport, frame } => {
                if self.transport_id() == Some(transport) {
                    self.process_frame(frame);
                } else {
                    trace!(%transport, "dropping frame from stale transport");
                }
            }
            Command::TransportClosed { transport, error } => {
                if self.transport_id() == Some(transport) {
                    self.on_terminal(error);
                }
            }
            Command::Signal { stream_id, signal } => self.signal(stream_id, signal),
            Command::Request { request, reply } => {
                let handle = self.open_request(request);
                if let Some(reply) = reply {
                    let _ = reply.send(handle);
                }
            }
            Command::ResumeServer { transport, params } => {
                if let Err(err) = self.resume_server(transport, params) {
                    warn!(error = %err, "server resume failed");
                }
            }
            Command::ResumeClient {
                transport,
                token,
                mut callback,
            } => {
                let Some(version) = self.protocol_version() else {
                    callback.on_resume_error(RSocketError::ColdResumeUnavailable);
                    return;
                };
                if let Err(err) = self.resume_client(token, transport, callback, version) {
                    warn!(error = %err, "client resume failed");
                }
            }
            Command::Disconnect { reason } => self.disconnect(&reason),
            Command::Close { reason, signal } => self.close(&reason, signal),
        }
    }

    fn open_request(&mut self, request: OutboundRequest) -> Option<StreamHandle> {
        match request {
            OutboundRequest::FireAndForget(payload) => {
                if let Err(err) = self.fire_and_forget(payload) {
                    debug!(error = %err, "fire-and-forget not sent");
                }
                None
            }
            OutboundRequest::MetadataPush(metadata) => {
                if let Err(err) = self.metadata_push(metadata) {
                    debug!(error = %err, "metadata push not sent");
                }
                None
            }
            OutboundRequest::RequestResponse { payload, observer } => self.request_response(payload, observer),
            OutboundRequest::RequestStream {
                payload,
                initial_request_n,
                subscriber,
            } => self.request_stream(payload, initial_request_n, subscriber),
            OutboundRequest::RequestChannel {
                payload,
                initial_request_n,
                subscriber,
            } => self.request_channel(payload, initial_request_n, subscriber),
        }
    }

    fn handle_connection_frame(&mut self, frame_type: FrameType, bytes: Bytes) {
        match frame_type {
            FrameType::Keepalive | FrameType::MetadataPush | FrameType::ResumeOk | FrameType::Error => {}
            other => {
                self.close_with_error(ErrorFrame::connection_error(format!(
                    "unexpected {other} frame on stream 0"
                )));
                return;
            }
        }
        let Some(frame) = self.decode(frame_type, bytes) else {
            return;
        };
        match frame {
            Frame::Keepalive(keepalive) => self.on_keepalive(keepalive),
            Frame::MetadataPush(push) => self.responder.handle_metadata_push(push.metadata),
            Frame::ResumeOk(ok) => self.on_resume_ok(ok),
            Frame::Error(error) => self.on_connection_error(error),
            other => debug!(frame_type = %other.frame_type(), "ignoring connection frame"),
        }
    }

    fn handle_stream_frame(&mut self, stream_id: StreamId, frame_type: FrameType, bytes: Bytes) {
        let stream_scoped = frame_type.is_request()
            || matches!(
                frame_type,
                FrameType::RequestN | FrameType::Cancel | FrameType::Payload | FrameType::Error
            );
        if !stream_scoped {
            self.close_with_error(ErrorFrame::connection_error(format!(
                "unexpected {frame_type} frame on stream {stream_id}"
            )));
            return;
        }
        if self.resume_callback.is_some() {
            self.close_with_error(ErrorFrame::connection_error("received stream frame while resuming"));
            return;
        }
        let Some(frame) = self.decode(frame_type, bytes) else {
            return;
        };
        match frame {
            Frame::Request(request) => self.on_request_frame(request),
            Frame::Payload(payload) => {
                let flags = payload.header.flags;
                self.with_stream(stream_id, |stream, w| {
                    stream.handler_mut().handle_payload(w, payload.payload, flags)
                });
            }
            Frame::RequestN(request_n) => {
                self.with_stream(stream_id, |stream, w| {
                    stream.handler_mut().handle_request_n(w, request_n.request_n)
                });
            }
            Frame::Cancel(_) => {
                self.with_stream(stream_id, |stream, w| stream.handler_mut().handle_cancel(w));
            }
            Frame::Error(error) => {
                let error = StreamError::from_error_frame(&error);
                self.with_stream(stream_id, |stream, w| stream.handler_mut().handle_error(w, error));
            }
            other => debug!(frame_type = %other.frame_type(), stream_id, "ignoring stream frame"),
        }
    }

    fn on_request_frame(&mut self, frame: RequestFrame) {
        let stream_id = frame.header.stream_id;
        let frame_type = frame.header.frame_type;
        let Some(stream_type) = StreamType::from_request_frame_type(frame_type) else {
            return;
        };
        if let Err(err) = self.stream_ids.register_peer_stream_id(stream_id) {
            self.close_with_error(ErrorFrame::connection_error(format!(
                "invalid stream id for {frame_type}: {err}"
            )));
            return;
        }
        self.stats.stream_opened(stream_type);
        let mut stream = StreamStateMachine::responder(stream_type, stream_id);
        stream
            .handler_mut()
            .handle_request(self, frame.initial_request_n, frame.payload, frame.header.flags);
        self.settle_stream(stream_id, stream);
    }

    fn on_keepalive(&mut self, frame: KeepaliveFrame) {
        self.resume_manager.reset_up_to_position(frame.position);
        self.stats.keepalive_received();
        match self.role {
            ConnectionRole::Acceptor => {
                if frame.respond() {
                    self.send_keepalive(false, frame.data);
                } else {
                    self.close_with_error(ErrorFrame::connection_error(
                        "keepalive without the respond flag",
                    ));
                }
            }
            ConnectionRole::Initiator => {
                if frame.respond() {
                    self.close_with_error(ErrorFrame::connection_error(
                        "client received keepalive with the respond flag",
                    ));
                } else if let Some(timer) = self.keepalive.as_mut() {
                    timer.keepalive_received();
                }
            }
        }
    }

    fn on_resume_ok(&mut self, frame: ResumeOkFrame) {
        if self.resume_callback.is_none() {
            self.close_with_error(ErrorFrame::connection_error("received RESUME_OK while not resuming"));
            return;
        }
        if !self.resume_manager.is_position_available(frame.position) {
            self.stats.resume_failed();
            self.close_with_error(ErrorFrame::connection_error(format!(
                "client cannot resume, server position {} is not available (first {}, last {})",
                frame.position,
                self.resume_manager.first_sent_position(),
                self.resume_manager.last_sent_position(),
            )));
            return;
        }
        if self.cold_resume_in_progress {
            self.rebuild_streams_after_cold_resume();
        }
        if let Some(mut callback) = self.resume_callback.take() {
            callback.on_resume_ok();
        }
        self.stats.resume_succeeded();
        self.resume_from_position(frame.position);
    }

    fn rebuild_streams_after_cold_resume(&mut self) {
        self.cold_resume_in_progress = false;
        self.stream_ids
            .set_next_after(self.resume_manager.largest_used_stream_id());
        let Some(mut handler) = self.cold_resume_handler.take() else {
            return;
        };
        let infos: Vec<_> = self
            .resume_manager
            .stream_resume_infos()
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        for (stream_id, info) in infos {
            if info.origin != RequestOrigin::Local || info.stream_type != StreamType::Stream {
                continue;
            }
            match handler.handle_requester_resume_stream(&info.token, info.consumer_allowance) {
                Some(subscriber) => {
                    debug!(stream_id, token = %info.token, "resumed requester stream");
                    let stream = StreamRequester::resumed(stream_id, subscriber, info.consumer_allowance);
                    self.streams
                        .insert(stream_id, StreamStateMachine::StreamRequester(stream));
                }
                None => {
                    debug!(stream_id, token = %info.token, "application declined resumed stream");
                    self.resume_manager.on_stream_closed(stream_id);
                    self.output_frame_or_enqueue(Frame::Cancel(CancelFrame::new(stream_id)));
                }
            }
        }
        self.cold_resume_handler = Some(handler);
    }

    fn on_connection_error(&mut self, frame: ErrorFrame) {
        let message = frame.message();
        if matches!(frame.code, ErrorCode::ConnectionError | ErrorCode::RejectedResume) {
            if let Some(mut callback) = self.resume_callback.take() {
                self.stats.resume_failed();
                callback.on_resume_error(RSocketError::ResumeFailed(message.clone()));
            }
        }
        self.close(&message, StreamCompletionSignal::Error);
    }

    // ---- output ----

    fn resume_from_position_or_close(&mut self, server_position: ResumePosition, client_position: ResumePosition) -> bool {
        let implied = self.resume_manager.implied_position();
        let client_ok = client_position == UNSPECIFIED_RESUME_POSITION || client_position <= implied;
        let server_ok = self.resume_manager.is_position_available(server_position);
        if !(client_ok && server_ok) {
            self.stats.resume_failed();
            self.close_with_error(ErrorFrame::rejected_resume(format!(
                "cannot resume server: client last received {server_position}, first available {client_position}; \
                 server first available {}, implied {implied}",
                self.resume_manager.first_sent_position(),
            )));
            return false;
        }
        match self.serialize(&Frame::ResumeOk(ResumeOkFrame::new(implied))) {
            Ok(bytes) => self.output_frame(bytes),
            Err(err) => {
                self.close(&err.to_string(), StreamCompletionSignal::ConnectionError);
                return false;
            }
        }
        self.stats.resume_succeeded();
        self.resume_from_position(server_position);
        true
    }

    fn resume_from_position(&mut self, position: ResumePosition) {
        if let Some(events) = self.events.as_mut() {
            events.on_streams_resumed();
        }
        let replay = self.resume_manager.frames_from_position(position);
        debug!(position, frames = replay.len(), "replaying frames after resume");
        for frame in replay {
            self.write_to_transport(frame);
        }
        self.send_pending_frames();
    }

    fn send_pending_frames(&mut self) {
        let pending = mem::take(&mut self.pending_output);
        for frame in pending {
            self.output_frame_or_enqueue_bytes(frame);
        }
        if self.transport.is_some() && self.resume_callback.is_none() {
            if let Some(timer) = self.keepalive.as_mut() {
                timer.start(Instant::now());
            }
        }
    }

    fn should_queue(&self) -> bool {
        self.transport.is_none() || self.resume_callback.is_some()
    }

    fn output_frame_or_enqueue(&mut self, frame: Frame) {
        match self.serialize(&frame) {
            Ok(bytes) => self.output_frame_or_enqueue_bytes(bytes),
            Err(err) => error!(frame_type = %frame.frame_type(), error = %err, "failed to serialize frame"),
        }
    }

    fn output_frame_or_enqueue_bytes(&mut self, bytes: Bytes) {
        if self.should_queue() {
            self.pending_output.push_back(bytes);
        } else {
            self.output_frame(bytes);
        }
    }

    /// Write a new frame, recording it in the ledger when resumable.
    fn output_frame(&mut self, bytes: Bytes) {
        if self.resumable {
            if let Some(serializer) = self.serializer.as_ref() {
                let frame_type = serializer.peek_frame_type(&bytes);
                let stream_id = serializer.peek_stream_id(&bytes).unwrap_or_default();
                let allowance = self.consumer_allowance(stream_id);
                self.resume_manager
                    .track_sent_frame(&bytes, frame_type, stream_id, allowance);
            }
        }
        self.write_to_transport(bytes);
    }

    fn write_to_transport(&mut self, bytes: Bytes) {
        if let Some(serializer) = self.serializer.as_ref() {
            self.stats.frame_written(serializer.peek_frame_type(&bytes));
        }
        match self.transport.as_mut() {
            Some(transport) => transport.output_frame_or_drop(bytes),
            None => trace!("no transport, frame dropped"),
        }
    }

    fn send_keepalive(&mut self, respond: bool, data: Bytes) {
        let position = self.resume_manager.implied_position();
        self.output_frame_or_enqueue(Frame::Keepalive(KeepaliveFrame::new(respond, position, data)));
    }

    fn serialize(&self, frame: &Frame) -> Result<Bytes> {
        let serializer = self.serializer.as_ref().ok_or(RSocketError::Disconnected)?;
        Ok(serializer.serialize_out(frame)?)
    }

    fn decode(&mut self, frame_type: FrameType, bytes: Bytes) -> Option<Frame> {
        let serializer = self.serializer.as_ref()?;
        match serializer.deserialize_from(bytes) {
            Ok(frame) => Some(frame),
            Err(err) => {
                self.close_with_error(ErrorFrame::connection_error(format!("invalid {frame_type} frame: {err}")));
                None
            }
        }
    }

    // ---- helpers ----

    fn require_role(&self, role: ConnectionRole) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(RSocketError::WrongRole(match role {
                ConnectionRole::Initiator => "initiator",
                ConnectionRole::Acceptor => "acceptor",
            }))
        }
    }

    fn set_protocol_version(&mut self, version: ProtocolVersion) -> Result<()> {
        match self.serializer.as_ref() {
            Some(serializer) if serializer.protocol_version() != version => Err(RSocketError::ProtocolVersionMismatch {
                negotiated: serializer.protocol_version(),
                requested: version,
            }),
            Some(_) => Ok(()),
            None => {
                let serializer = create_frame_serializer(version).ok_or(RSocketError::UnsupportedVersion(version))?;
                self.serializer = Some(serializer);
                Ok(())
            }
        }
    }

    fn ensure_or_autodetect_serializer(&mut self, first_frame: &[u8]) -> bool {
        if self.serializer.is_some() {
            return true;
        }
        if self.role.is_initiator() {
            return false;
        }
        match create_autodetected_serializer(first_frame) {
            Some(serializer) => {
                debug!(version = %serializer.protocol_version(), "detected protocol version");
                self.serializer = Some(serializer);
                true
            }
            None => false,
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.closed {
            Err(RSocketError::Closed)
        } else if self.transport.is_none() {
            Err(RSocketError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn allocate_stream_id(&mut self) -> std::result::Result<StreamId, StreamError> {
        if self.ensure_available().is_err() {
            return Err(StreamError::Unavailable);
        }
        self.stream_ids
            .next_stream_id()
            .map_err(|err| StreamError::Rejected(err.to_string()))
    }

    /// `None` while the stream is out of the table being driven.
    fn consumer_allowance(&self, stream_id: StreamId) -> Option<u32> {
        self.streams
            .get(&stream_id)
            .map(|stream| stream.handler().consumer_allowance())
    }

    /// Run `f` against a stream while it is out of the table.
    fn with_stream(&mut self, stream_id: StreamId, f: impl FnOnce(&mut StreamStateMachine, &mut Self)) {
        let Some(mut stream) = self.streams.remove(&stream_id) else {
            trace!(stream_id, "no such stream, ignoring");
            return;
        };
        f(&mut stream, self);
        self.settle_stream(stream_id, stream);
    }

    fn settle_stream(&mut self, stream_id: StreamId, mut stream: StreamStateMachine) {
        if self.closed && !stream.handler().is_closed() {
            stream.handler_mut().end_stream(StreamCompletionSignal::SocketClosed);
        }
        if stream.handler().is_closed() {
            stream.handler().base().mark_terminated();
            self.on_stream_closed(stream_id);
        } else {
            self.resume_manager
                .update_stream_allowance(stream_id, stream.handler().consumer_allowance());
            self.streams.insert(stream_id, stream);
        }
    }

    /// Forget a terminated stream.
    pub(crate) fn on_stream_closed(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
        self.resume_manager.on_stream_closed(stream_id);
        self.stats.stream_closed();
        trace!(stream_id, "stream closed");
    }

    fn close_streams(&mut self, signal: StreamCompletionSignal) {
        for (stream_id, mut stream) in self.streams.drain() {
            trace!(stream_id, %signal, "ending stream");
            stream.handler_mut().end_stream(signal);
            stream.handler().base().mark_terminated();
        }
    }

    fn close_frame_transport(&mut self, reason: &str) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        debug!(transport = %transport.id(), reason, "closing transport");
        if let Some(timer) = self.keepalive.as_mut() {
            timer.stop();
        }
        if let Some(mut callback) = self.resume_callback.take() {
            callback.on_resume_error(RSocketError::ResumeFailed(reason.to_string()));
        }
        transport.close();
    }

    fn next_posted(&self) -> Option<Command> {
        self.inbox.as_ref().and_then(Inbox::try_recv)
    }

    /// Apply commands posted while no event loop drives this connection.
    fn drain_inbox(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        while let Some(command) = self.next_posted() {
            self.handle_command(command);
        }
        self.draining = false;
    }
}

impl StreamsWriter for RSocketStateMachine {
    fn write_new_stream(&mut self, stream_id: StreamId, stream_type: StreamType, initial_request_n: u32, payload: Payload) {
        if stream_type != StreamType::FireAndForget {
            if let Some(handler) = self.cold_resume_handler.as_mut() {
                let token = handler.generate_stream_token(&payload, stream_id, stream_type);
                self.resume_manager
                    .on_stream_open(stream_id, stream_type, RequestOrigin::Local, token);
            }
        }
        self.stats.stream_opened(stream_type);

        let fragments = split_payload(payload, self.config.max_fragment_size);
        let last = fragments.len() - 1;
        for (index, fragment) in fragments.into_iter().enumerate() {
            let follows = if index < last {
                FrameFlags::FOLLOWS
            } else {
                FrameFlags::empty()
            };
            let frame = if index == 0 {
                Frame::Request(RequestFrame::new(
                    stream_type.request_frame_type(),
                    stream_id,
                    follows,
                    initial_request_n,
                    fragment,
                ))
            } else {
                Frame::Payload(PayloadFrame::new(stream_id, follows, fragment))
            };
            self.output_frame_or_enqueue(frame);
        }
    }

    fn write_payload(&mut self, stream_id: StreamId, payload: Payload, flags: FrameFlags) {
        let fragments = split_payload(payload, self.config.max_fragment_size);
        let last = fragments.len() - 1;
        for (index, fragment) in fragments.into_iter().enumerate() {
            let flags = if index < last { FrameFlags::FOLLOWS } else { flags };
            self.output_frame_or_enqueue(Frame::Payload(PayloadFrame::new(stream_id, flags, fragment)));
        }
    }

    fn write_request_n(&mut self, stream_id: StreamId, n: u32) {
        self.output_frame_or_enqueue(Frame::RequestN(RequestNFrame::new(stream_id, n)));
    }

    fn write_cancel(&mut self, stream_id: StreamId) {
        self.output_frame_or_enqueue(Frame::Cancel(CancelFrame::new(stream_id)));
    }

    fn write_error(&mut self, frame: ErrorFrame) {
        self.output_frame_or_enqueue(Frame::Error(frame));
    }

    fn on_new_stream_ready(
        &mut self,
        stream_id: StreamId,
        stream_type: StreamType,
        payload: Payload,
        cancelled: Arc<AtomicBool>,
    ) -> Option<Box<dyn Subscriber>> {
        if stream_type != StreamType::FireAndForget {
            if let Some(handler) = self.cold_resume_handler.as_mut() {
                let token = handler.generate_stream_token(&payload, stream_id, stream_type);
                self.resume_manager
                    .on_stream_open(stream_id, stream_type, RequestOrigin::Remote, token);
            }
        }
        let handle = StreamHandle::new(stream_id, self.mailbox(), cancelled);
        match stream_type {
            StreamType::FireAndForget => {
                self.responder.handle_fire_and_forget(payload, stream_id);
                None
            }
            StreamType::RequestResponse => {
                self.responder.handle_request_response(payload, handle);
                None
            }
            StreamType::Stream => {
                self.responder.handle_request_stream(payload, handle);
                None
            }
            StreamType::Channel => Some(self.responder.handle_request_channel(payload, handle)),
        }
    }
}

impl Drop for RSocketStateMachine {
    fn drop(&mut self) {
        if !self.closed {
            self.close("connection dropped", StreamCompletionSignal::SocketClosed);
        }
    }
}
