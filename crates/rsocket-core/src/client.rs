//! Blocking client over a socket endpoint.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rsocket_frame::{FrameReader, Payload};
use rsocket_transport::{Endpoint, SocketStream};
use tracing::{debug, info};

use crate::command::{Command, OutboundRequest, StreamHandle};
use crate::connection::RSocketStateMachine;
use crate::error::{RSocketError, Result, StreamCompletionSignal};
use crate::event_loop::{spawn_reader, ConnectionHandle, EventLoop};
use crate::handler::{
    resume_status_channel, single_channel, subscriber_channel, RejectingHandler, RequestHandler, SingleObserver,
    Subscriber, SubscriberEvent,
};
use crate::params::{ConnectionConfig, ConnectionRole, SetupParameters};
use crate::registry::{lock_connection, SharedConnection};
use crate::transport::{FrameTransport, SocketTransport};

/// Client connection driven by a background event loop.
pub struct RSocketClient {
    handle: ConnectionHandle,
    setup: SetupParameters,
}

impl RSocketClient {
    /// Connect and send SETUP with default configuration.
    pub fn connect(endpoint: &Endpoint, setup: SetupParameters) -> Result<Self> {
        Self::connect_with_config(endpoint, setup, ConnectionConfig::default(), Box::new(RejectingHandler))
    }

    /// Connect with explicit configuration and a responder for server-initiated requests.
    pub fn connect_with_config(
        endpoint: &Endpoint,
        setup: SetupParameters,
        config: ConnectionConfig,
        responder: Box<dyn RequestHandler>,
    ) -> Result<Self> {
        let machine = RSocketStateMachine::new(ConnectionRole::Initiator, config, responder);
        Self::connect_machine(endpoint, setup, machine)
    }

    /// Connect a prepared state machine, e.g. one with events or stats hooks.
    pub fn connect_machine(endpoint: &Endpoint, setup: SetupParameters, mut machine: RSocketStateMachine) -> Result<Self> {
        let stream = rsocket_transport::connect(endpoint)?;
        let (transport, reader) = split_stream(stream)?;
        let transport_id = transport.id();
        machine.connect_client(Box::new(transport), setup.clone())?;

        let handle = EventLoop::spawn(machine, "rsocket-client", None)?;
        spawn_reader(reader, transport_id, handle.mailbox())?;
        info!(%endpoint, resumable = setup.resumable, "client connected");
        Ok(Self { handle, setup })
    }

    pub fn connection(&self) -> &SharedConnection {
        self.handle.connection()
    }

    pub fn setup(&self) -> &SetupParameters {
        &self.setup
    }

    pub fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        self.post(OutboundRequest::FireAndForget(payload), None)
    }

    pub fn metadata_push(&self, metadata: Bytes) -> Result<()> {
        self.post(OutboundRequest::MetadataPush(metadata), None)
    }

    pub fn request_response(&self, payload: Payload, observer: Box<dyn SingleObserver>) -> Result<Option<StreamHandle>> {
        self.request(OutboundRequest::RequestResponse { payload, observer })
    }

    /// Send a request-response and wait for its result.
    pub fn request_response_blocking(&self, payload: Payload, timeout: Duration) -> Result<Payload> {
        let (observer, results) = single_channel();
        let handle = self.request_response(payload, observer)?;
        match results.recv_timeout(timeout) {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(err)) => Err(RSocketError::Stream(err)),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Some(handle) = handle {
                    handle.cancel();
                }
                Err(RSocketError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RSocketError::Closed),
        }
    }

    pub fn request_stream(
        &self,
        payload: Payload,
        initial_request_n: u32,
        subscriber: Box<dyn Subscriber>,
    ) -> Result<Option<StreamHandle>> {
        self.request(OutboundRequest::RequestStream {
            payload,
            initial_request_n,
            subscriber,
        })
    }

    /// Request up to `limit` items and collect them until completion.
    ///
    /// The stream is canceled once `limit` items arrived without completion.
    pub fn request_stream_blocking(&self, payload: Payload, limit: u32, timeout: Duration) -> Result<Vec<Payload>> {
        let (subscriber, events) = subscriber_channel();
        let handle = self.request_stream(payload, limit, subscriber)?;
        let deadline = Instant::now() + timeout;
        let mut items = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(SubscriberEvent::Next(item)) => {
                    items.push(item);
                    if items.len() as u64 >= u64::from(limit) {
                        if let Some(handle) = handle.as_ref() {
                            handle.cancel();
                        }
                        return Ok(items);
                    }
                }
                Ok(SubscriberEvent::Complete) => return Ok(items),
                Ok(SubscriberEvent::Error(err)) => return Err(RSocketError::Stream(err)),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Some(handle) = handle.as_ref() {
                        handle.cancel();
                    }
                    return Err(RSocketError::Timeout(timeout));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(RSocketError::Closed),
            }
        }
    }

    pub fn request_channel(
        &self,
        payload: Payload,
        initial_request_n: u32,
        subscriber: Box<dyn Subscriber>,
    ) -> Result<Option<StreamHandle>> {
        self.request(OutboundRequest::RequestChannel {
            payload,
            initial_request_n,
            subscriber,
        })
    }

    /// Resume this session over a new connection to `endpoint`.
    ///
    /// Blocks until RESUME_OK or an error arrives.
    pub fn resume(&self, endpoint: &Endpoint, timeout: Duration) -> Result<()> {
        if !self.setup.resumable {
            return Err(RSocketError::ResumeFailed("session was not set up as resumable".to_string()));
        }
        let stream = rsocket_transport::connect(endpoint)?;
        let (transport, reader) = split_stream(stream)?;
        let transport_id = transport.id();
        let (callback, status) = resume_status_channel();
        if !self.handle.post(Command::ResumeClient {
            transport: Box::new(transport),
            token: self.setup.token.clone(),
            callback,
        }) {
            return Err(RSocketError::Closed);
        }
        spawn_reader(reader, transport_id, self.handle.mailbox())?;
        match status.recv_timeout(timeout) {
            Ok(Ok(())) => {
                info!(%endpoint, "session resumed");
                Ok(())
            }
            Ok(Err(reason)) => Err(RSocketError::ResumeFailed(reason)),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(RSocketError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(RSocketError::ResumeFailed("resume was abandoned before completing".to_string()))
            }
        }
    }

    /// Drop the transport but keep streams for [`resume`](Self::resume).
    pub fn disconnect(&self, reason: &str) {
        self.handle.post(Command::Disconnect {
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        lock_connection(self.handle.connection()).is_closed()
    }

    /// Close the connection and wait for the event loop to exit.
    pub fn close(self) {
        debug!("closing client");
        self.handle.post(Command::Close {
            reason: "client closed".to_string(),
            signal: StreamCompletionSignal::ConnectionEnd,
        });
        self.handle.join();
    }

    fn post(&self, request: OutboundRequest, reply: Option<mpsc::Sender<Option<StreamHandle>>>) -> Result<()> {
        if self.handle.post(Command::Request { request, reply }) {
            Ok(())
        } else {
            Err(RSocketError::Closed)
        }
    }

    fn request(&self, request: OutboundRequest) -> Result<Option<StreamHandle>> {
        let (reply, handle) = mpsc::channel();
        self.post(request, Some(reply))?;
        handle.recv().map_err(|_| RSocketError::Closed)
    }
}

/// Split a connected socket into a writing transport and a frame reader.
pub fn split_stream(stream: SocketStream) -> Result<(SocketTransport, FrameReader<SocketStream>)> {
    let read_half = stream.try_clone()?;
    Ok((SocketTransport::new(stream), FrameReader::new(read_half)))
}
