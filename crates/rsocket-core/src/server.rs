//! Blocking server: accepts transports, runs the SETUP/RESUME handshake and
//! hands each session to its own event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rsocket_frame::{ErrorFrame, FrameReader, FrameWriter, MAX_FRAME_LENGTH};
use rsocket_transport::{Endpoint, Listener, SocketStream};
use tracing::{debug, info, warn};

use crate::acceptor::{AcceptorConfig, Handshake, SetupResumeAcceptor};
use crate::command::Command;
use crate::connection::RSocketStateMachine;
use crate::error::{RSocketError, Result};
use crate::event_loop::{spawn_reader, ConnectionHandle, EventLoop};
use crate::handler::{NoopStats, RSocketStats, RequestHandler};
use crate::params::{ConnectionConfig, ConnectionRole, SetupParameters};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::transport::{FrameTransport, SocketTransport};

/// Result of handling one incoming transport.
pub enum AcceptOutcome {
    /// A new session is running.
    Connected(ConnectionHandle),
    /// The transport was attached to an existing session.
    Resumed,
    /// The first frame was rejected or never arrived.
    Rejected(RSocketError),
}

impl AcceptOutcome {
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Connected(handle) => handle.id(),
            _ => None,
        }
    }
}

pub struct RSocketServer {
    listener: Listener,
    acceptor: SetupResumeAcceptor,
    config: ConnectionConfig,
    registry: ConnectionRegistry,
    stats: Arc<dyn RSocketStats>,
}

impl RSocketServer {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let listener = Listener::bind(endpoint)?;
        info!(%endpoint, "server listening");
        Ok(Self {
            listener,
            acceptor: SetupResumeAcceptor::default(),
            config: ConnectionConfig {
                send_keepalives: false,
                ..ConnectionConfig::default()
            },
            registry: ConnectionRegistry::new(),
            stats: Arc::new(NoopStats),
        })
    }

    pub fn with_acceptor_config(mut self, config: AcceptorConfig) -> Self {
        self.acceptor = SetupResumeAcceptor::new(config);
        self
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn RSocketStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(self.listener.local_endpoint()?)
    }

    /// Accept one transport and complete its handshake.
    ///
    /// `factory` builds the responder for a new session from its SETUP.
    pub fn accept_one<F>(&self, factory: &F) -> Result<AcceptOutcome>
    where
        F: Fn(&SetupParameters) -> Box<dyn RequestHandler>,
    {
        let stream = self.listener.accept()?;
        match stream.peer_credentials() {
            Some((uid, _, pid)) => debug!(transport = stream.transport_name(), uid, pid, "transport accepted"),
            None => debug!(transport = stream.transport_name(), "transport accepted"),
        }
        Ok(self.handle_stream(stream, factory))
    }

    /// Accept until `shutdown` is set, then close every live session.
    ///
    /// The flag is checked between accepts.
    pub fn serve<F>(&self, factory: F, shutdown: &AtomicBool, drain_timeout: Duration) -> Result<()>
    where
        F: Fn(&SetupParameters) -> Box<dyn RequestHandler>,
    {
        let mut sessions: Vec<ConnectionHandle> = Vec::new();
        while !shutdown.load(Ordering::SeqCst) {
            let outcome = match self.accept_one(&factory) {
                Ok(outcome) => outcome,
                Err(err) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    return Err(err);
                }
            };
            match outcome {
                AcceptOutcome::Connected(handle) => sessions.push(handle),
                AcceptOutcome::Resumed => {}
                AcceptOutcome::Rejected(err) => debug!(error = %err, "handshake rejected"),
            }
            sessions.retain(|handle| !handle.is_finished());
        }

        if !self.registry.shutdown_and_wait(drain_timeout) {
            warn!(remaining = self.registry.len(), "connections still open after shutdown timeout");
        }
        for handle in sessions {
            if handle.is_finished() {
                handle.join();
            }
        }
        Ok(())
    }

    fn handle_stream<F>(&self, stream: SocketStream, factory: &F) -> AcceptOutcome
    where
        F: Fn(&SetupParameters) -> Box<dyn RequestHandler>,
    {
        match self.handshake(stream, factory) {
            Ok(outcome) => outcome,
            Err(err) => AcceptOutcome::Rejected(err),
        }
    }

    fn handshake<F>(&self, stream: SocketStream, factory: &F) -> Result<AcceptOutcome>
    where
        F: Fn(&SetupParameters) -> Box<dyn RequestHandler>,
    {
        stream.set_read_timeout(Some(self.acceptor.config().timeout))?;
        let mut reader = FrameReader::new(stream.try_clone()?);
        let mut writer = FrameWriter::new(stream.try_clone()?);
        let handshake = self.acceptor.accept(&mut reader, &mut writer)?;
        stream.set_read_timeout(None)?;
        reader.set_max_frame_size(MAX_FRAME_LENGTH);

        match handshake {
            Handshake::Setup(params) => {
                let transport = SocketTransport::new(stream);
                let transport_id = transport.id();
                let mut machine =
                    RSocketStateMachine::new(ConnectionRole::Acceptor, self.config.clone(), factory(&params))
                        .with_stats(Arc::clone(&self.stats));
                machine.connect_server(Box::new(transport), &params)?;
                let handle = EventLoop::spawn(machine, "rsocket-server-conn", Some(&self.registry))?;
                spawn_reader(reader, transport_id, handle.mailbox())?;
                info!(resumable = params.resumable, "session established");
                Ok(AcceptOutcome::Connected(handle))
            }
            Handshake::Resume(params) => {
                let Some(mailbox) = self.registry.find_by_token(&params.token) else {
                    return Err(self
                        .acceptor
                        .reject(&mut writer, ErrorFrame::rejected_resume("unknown resume token")));
                };
                let transport = SocketTransport::new(stream);
                let transport_id = transport.id();
                if !mailbox.post(Command::ResumeServer {
                    transport: Box::new(transport),
                    params,
                }) {
                    return Err(self
                        .acceptor
                        .reject(&mut writer, ErrorFrame::rejected_resume("session already closed")));
                }
                spawn_reader(reader, transport_id, mailbox)?;
                info!("session resumed on new transport");
                Ok(AcceptOutcome::Resumed)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use rsocket_frame::{ErrorCode, Frame, FrameSerializer, FrameSerializerV1, Payload, ProtocolVersion, ResumeFrame, ResumeToken};

    use super::*;
    use crate::client::RSocketClient;
    use crate::command::StreamHandle;

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/rsocket-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("server.sock")
    }

    fn cleanup(path: &std::path::Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    struct Echo;

    impl RequestHandler for Echo {
        fn handle_request_response(&mut self, request: Payload, response: StreamHandle) {
            response.success(request);
        }

        fn handle_request_stream(&mut self, request: Payload, response: StreamHandle) {
            for index in 0..3 {
                response.next(Payload::new(format!("{}-{index}", request.data_utf8_lossy())));
            }
            response.complete();
        }
    }

    fn echo_factory(_setup: &SetupParameters) -> Box<dyn RequestHandler> {
        Box::new(Echo)
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn serves_request_response_and_stream() {
        let sock_path = make_sock_path("echo");
        let endpoint = Endpoint::Unix(sock_path.clone());
        let server = RSocketServer::bind(&endpoint).expect("server should bind");

        let accept = thread::spawn(move || {
            let outcome = server.accept_one(&echo_factory).expect("accept should succeed");
            let AcceptOutcome::Connected(handle) = outcome else {
                panic!("setup should open a session");
            };
            handle.join();
        });

        let client = RSocketClient::connect(&endpoint, SetupParameters::default()).expect("client should connect");
        let reply = client
            .request_response_blocking(Payload::from("hello"), TIMEOUT)
            .expect("response should arrive");
        assert_eq!(reply, Payload::from("hello"));

        let items = client
            .request_stream_blocking(Payload::from("item"), 10, TIMEOUT)
            .expect("stream should complete");
        assert_eq!(
            items,
            vec![Payload::from("item-0"), Payload::from("item-1"), Payload::from("item-2")]
        );

        client.close();
        accept.join().expect("server thread should finish");
        cleanup(&sock_path);
    }

    #[test]
    fn resumes_session_on_new_transport() {
        let sock_path = make_sock_path("resume");
        let endpoint = Endpoint::Unix(sock_path.clone());
        let server = RSocketServer::bind(&endpoint).expect("server should bind");

        let accept = thread::spawn(move || {
            let first = server.accept_one(&echo_factory).expect("accept should succeed");
            assert!(first.connection_id().is_some());
            let second = server.accept_one(&echo_factory).expect("accept should succeed");
            assert!(matches!(second, AcceptOutcome::Resumed));
            assert_eq!(server.registry().len(), 1);
            (server, first)
        });

        let client = RSocketClient::connect(&endpoint, SetupParameters::resumable()).expect("client should connect");
        client
            .request_response_blocking(Payload::from("before"), TIMEOUT)
            .expect("response should arrive");

        client.disconnect("switching transport");
        client.resume(&endpoint, TIMEOUT).expect("session should resume");
        let reply = client
            .request_response_blocking(Payload::from("after"), TIMEOUT)
            .expect("response should arrive after resume");
        assert_eq!(reply, Payload::from("after"));

        let (server, first) = accept.join().expect("server thread should finish");
        client.close();
        // A resumable session outlives its transport; only shutdown ends it.
        assert!(server.registry().shutdown_and_wait(TIMEOUT));
        assert!(server.registry().is_empty());
        if let AcceptOutcome::Connected(handle) = first {
            handle.join();
        }
        cleanup(&sock_path);
    }

    #[test]
    fn rejects_resume_with_unknown_token() {
        let sock_path = make_sock_path("unknown");
        let endpoint = Endpoint::Unix(sock_path.clone());
        let server = RSocketServer::bind(&endpoint).expect("server should bind");

        let accept = thread::spawn(move || server.accept_one(&echo_factory).expect("accept should succeed"));

        let stream = rsocket_transport::connect(&endpoint).expect("client should connect");
        let mut writer = FrameWriter::new(stream.try_clone().expect("stream should clone"));
        let resume = FrameSerializerV1
            .serialize_out(&Frame::Resume(ResumeFrame::new(
                ResumeToken::generate(),
                0,
                0,
                ProtocolVersion::V1_0,
            )))
            .expect("RESUME should encode");
        writer.send(&resume).expect("RESUME should send");

        let mut reader = FrameReader::new(stream);
        let reply = reader.read_frame().expect("server should answer");
        let Frame::Error(error) = FrameSerializerV1.deserialize_from(reply).expect("reply should decode") else {
            panic!("server should answer with ERROR");
        };
        assert_eq!(error.code, ErrorCode::RejectedResume);

        let outcome = accept.join().expect("server thread should finish");
        assert!(matches!(
            outcome,
            AcceptOutcome::Rejected(RSocketError::SetupRejected {
                code: ErrorCode::RejectedResume,
                ..
            })
        ));
        cleanup(&sock_path);
    }
}
