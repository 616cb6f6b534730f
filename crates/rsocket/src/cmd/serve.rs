use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use rsocket_core::{
    lock_connection, AcceptOutcome, AcceptorConfig, ConnectionHandle, ConnectionState, RSocketServer,
    RequestHandler, SetupParameters, StreamError, StreamHandle, Subscriber,
};
use rsocket_frame::Payload;
use rsocket_transport::Endpoint;

use crate::cmd::{parse_endpoint, ServeArgs};
use crate::exit::{rsocket_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_payload, OutputFormat, PayloadSource};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Echoes every interaction back to the requester.
struct EchoResponder {
    stream_count: u32,
    format: OutputFormat,
    peer: String,
}

impl EchoResponder {
    fn print(&self, interaction: &str, stream_id: Option<u32>, payload: &Payload) {
        let source = PayloadSource {
            interaction,
            stream_id,
            peer: &self.peer,
        };
        print_payload(payload, source, self.format);
    }
}

impl RequestHandler for EchoResponder {
    fn handle_fire_and_forget(&mut self, request: Payload, stream_id: u32) {
        tracing::info!(stream_id, size = request.len(), "fire-and-forget received");
        self.print("fnf", Some(stream_id), &request);
    }

    fn handle_request_response(&mut self, request: Payload, response: StreamHandle) {
        self.print("response", Some(response.stream_id()), &request);
        response.success(request);
    }

    fn handle_request_stream(&mut self, request: Payload, response: StreamHandle) {
        self.print("stream", Some(response.stream_id()), &request);
        for _ in 0..self.stream_count {
            response.next(request.clone());
        }
        response.complete();
    }

    fn handle_request_channel(&mut self, request: Payload, response: StreamHandle) -> Box<dyn Subscriber> {
        self.print("channel", Some(response.stream_id()), &request);
        response.next(request);
        response.request(i32::MAX as u32);
        Box::new(ChannelEcho { response })
    }

    fn handle_metadata_push(&mut self, metadata: Bytes) {
        tracing::info!(size = metadata.len(), "metadata push received");
        let payload = Payload {
            data: Bytes::new(),
            metadata: Some(metadata),
        };
        self.print("metadata-push", None, &payload);
    }
}

/// Sends each inbound channel item straight back.
struct ChannelEcho {
    response: StreamHandle,
}

impl Subscriber for ChannelEcho {
    fn on_next(&mut self, payload: Payload) {
        self.response.next(payload);
    }

    fn on_complete(&mut self) {
        self.response.complete();
    }

    fn on_error(&mut self, error: StreamError) {
        tracing::debug!(stream_id = self.response.stream_id(), error = %error, "channel ended by requester");
    }
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint = parse_endpoint(&args.endpoint)?;
    let server = RSocketServer::bind(&endpoint)
        .map_err(|err| rsocket_error("bind failed", err))?
        .with_acceptor_config(AcceptorConfig {
            allow_resumption: args.resumable,
            ..AcceptorConfig::default()
        });
    let local = server
        .local_endpoint()
        .map_err(|err| rsocket_error("bind failed", err))?;
    tracing::info!(endpoint = %local, resumable = args.resumable, "serving");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), local.clone())?;

    let mut sessions: Vec<ConnectionHandle> = Vec::new();
    let mut accepted = 0usize;
    let peer = local.to_string();
    let factory = |setup: &SetupParameters| -> Box<dyn RequestHandler> {
        tracing::info!(
            data_mime_type = %setup.data_mime_type,
            resumable = setup.resumable,
            "new session"
        );
        Box::new(EchoResponder {
            stream_count: args.stream_count,
            format,
            peer: peer.clone(),
        })
    };

    while running.load(Ordering::SeqCst) {
        let outcome = match server.accept_one(&factory) {
            Ok(outcome) => outcome,
            Err(err) if !running.load(Ordering::SeqCst) => {
                tracing::debug!(error = %err, "accept interrupted by shutdown");
                break;
            }
            Err(err) => return Err(rsocket_error("accept failed", err)),
        };
        match outcome {
            AcceptOutcome::Connected(handle) => {
                accepted += 1;
                sessions.push(handle);
            }
            AcceptOutcome::Resumed => tracing::info!("session resumed"),
            AcceptOutcome::Rejected(err) => tracing::warn!(error = %err, "handshake failed"),
        }

        if args.max_sessions.is_some_and(|max| accepted >= max) {
            wait_for_sessions(&sessions, &running);
            break;
        }
    }

    if !server.registry().shutdown_and_wait(SHUTDOWN_TIMEOUT) {
        tracing::warn!(remaining = server.registry().len(), "sessions still open at exit");
    }
    for handle in sessions {
        if handle.is_finished() {
            handle.join();
        }
    }
    Ok(SUCCESS)
}

/// Block until every session has lost its transport or closed.
fn wait_for_sessions(sessions: &[ConnectionHandle], running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        let active = sessions.iter().any(|handle| {
            matches!(
                lock_connection(handle.connection()).state(),
                ConnectionState::Connected | ConnectionState::Resuming
            )
        });
        if !active {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>, endpoint: Endpoint) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = rsocket_transport::connect(&endpoint);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
