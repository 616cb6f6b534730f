//! Two engines driven against each other over in-memory transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rsocket_core::{
    resume_status_channel, single_channel, subscriber_channel, ColdResumeHandler, ConnectionConfig,
    ConnectionEvents, ConnectionRole, ConnectionState, MemoryPeer, MemoryTransport, RSocketError,
    RSocketStateMachine, RequestHandler, ResumeParameters, ResumeSnapshot, SetupParameters, StreamCompletionSignal,
    StreamError, StreamHandle, StreamSignal, Subscriber, SubscriberEvent, WarmResumeManager,
};
use rsocket_frame::{
    ErrorCode, Frame, FrameFlags, FrameSerializer, FrameSerializerV1, FrameType, Payload, PayloadFrame,
    ProtocolVersion, RequestFrame, ResumeOkFrame,
};

fn config(send_keepalives: bool) -> ConnectionConfig {
    ConnectionConfig {
        send_keepalives,
        ..ConnectionConfig::default()
    }
}

fn encode(frame: Frame) -> Bytes {
    FrameSerializerV1.serialize_out(&frame).expect("frame should encode")
}

fn decode(bytes: Bytes) -> Frame {
    FrameSerializerV1.deserialize_from(bytes).expect("frame should decode")
}

fn next_item(stream_id: u32, data: &'static str) -> Bytes {
    encode(Frame::Payload(PayloadFrame::new(stream_id, FrameFlags::NEXT, Payload::from(data))))
}

/// Responder that echoes request-response and keeps stream handles for the test.
#[derive(Clone, Default)]
struct TestResponder {
    streams: Arc<Mutex<Vec<StreamHandle>>>,
    fire_and_forget: Arc<Mutex<Vec<Payload>>>,
    metadata: Arc<Mutex<Vec<Bytes>>>,
}

impl TestResponder {
    fn stream(&self, index: usize) -> StreamHandle {
        self.streams.lock().expect("lock should not be poisoned")[index].clone()
    }
}

impl RequestHandler for TestResponder {
    fn handle_fire_and_forget(&mut self, request: Payload, _stream_id: u32) {
        self.fire_and_forget.lock().expect("lock should not be poisoned").push(request);
    }

    fn handle_request_response(&mut self, request: Payload, response: StreamHandle) {
        response.success(request);
    }

    fn handle_request_stream(&mut self, _request: Payload, response: StreamHandle) {
        self.streams.lock().expect("lock should not be poisoned").push(response);
    }

    fn handle_request_channel(&mut self, request: Payload, response: StreamHandle) -> Box<dyn Subscriber> {
        response.next(request);
        let (subscriber, events) = subscriber_channel();
        let echo = response.clone();
        std::thread::spawn(move || {
            for event in events {
                match event {
                    SubscriberEvent::Next(payload) => echo.next(payload),
                    SubscriberEvent::Complete => {
                        echo.complete();
                        break;
                    }
                    SubscriberEvent::Error(_) => break,
                }
            }
        });
        response.request(16);
        subscriber
    }

    fn handle_metadata_push(&mut self, metadata: Bytes) {
        self.metadata.lock().expect("lock should not be poisoned").push(metadata);
    }
}

struct Pair {
    client: RSocketStateMachine,
    client_peer: MemoryPeer,
    server: RSocketStateMachine,
    server_peer: MemoryPeer,
    responder: TestResponder,
    setup: SetupParameters,
}

impl Pair {
    fn new(setup: SetupParameters) -> Self {
        Self::with_config(setup, config(false))
    }

    fn with_config(setup: SetupParameters, config: ConnectionConfig) -> Self {
        let responder = TestResponder::default();
        let mut client = RSocketStateMachine::new(ConnectionRole::Initiator, config.clone(), Box::new(TestResponder::default()));
        let (client_transport, client_peer) = MemoryTransport::new();
        client
            .connect_client(Box::new(client_transport), setup.clone())
            .expect("client should connect");

        let frames = client_peer.take_frames();
        assert_eq!(frames.len(), 1, "only SETUP should be written");
        let Frame::Setup(frame) = decode(frames[0].clone()) else {
            panic!("first frame should be SETUP");
        };
        let params = SetupParameters::from(frame);
        assert_eq!(params.resumable, setup.resumable);

        let mut server = RSocketStateMachine::new(ConnectionRole::Acceptor, config, Box::new(responder.clone()));
        let (server_transport, server_peer) = MemoryTransport::new();
        server
            .connect_server(Box::new(server_transport), &params)
            .expect("server should connect");

        Self {
            client,
            client_peer,
            server,
            server_peer,
            responder,
            setup,
        }
    }

    /// Deliver frames both ways until neither side writes anything.
    fn pump(&mut self) {
        loop {
            let to_server = self.client_peer.take_frames();
            for frame in &to_server {
                self.server.process_frame(frame.clone());
            }
            let to_client = self.server_peer.take_frames();
            for frame in &to_client {
                self.client.process_frame(frame.clone());
            }
            if to_server.is_empty() && to_client.is_empty() {
                break;
            }
        }
    }

    /// Apply signals posted from handles, then deliver.
    fn settle(&mut self) {
        let now = Instant::now();
        self.server.handle_timeout(now);
        self.client.handle_timeout(now);
        self.pump();
    }
}

fn events(rx: &mpsc::Receiver<SubscriberEvent>) -> Vec<SubscriberEvent> {
    rx.try_iter().collect()
}

#[test]
fn request_response_round_trip() {
    let mut pair = Pair::new(SetupParameters::default());
    let (observer, result) = single_channel();
    let handle = pair
        .client
        .request_response(Payload::with_metadata("ping", "meta"), observer)
        .expect("request should open");
    assert_eq!(handle.stream_id(), 1);

    pair.pump();
    assert_eq!(
        result.try_recv().expect("response should arrive"),
        Ok(Payload::with_metadata("ping", "meta"))
    );
    assert_eq!(pair.client.stream_count(), 0);
    assert_eq!(pair.server.stream_count(), 0);
}

#[test]
fn request_stream_honours_request_n() {
    let mut pair = Pair::new(SetupParameters::default());
    let (subscriber, rx) = subscriber_channel();
    let handle = pair
        .client
        .request_stream(Payload::from("feed"), 2, subscriber)
        .expect("stream should open");
    pair.pump();

    let producer = pair.responder.stream(0);
    for item in ["a", "b", "c"] {
        producer.next(Payload::from(item));
    }
    producer.complete();
    pair.settle();
    assert_eq!(
        events(&rx),
        vec![SubscriberEvent::Next(Payload::from("a")), SubscriberEvent::Next(Payload::from("b"))]
    );

    handle.request(5);
    pair.settle();
    assert_eq!(
        events(&rx),
        vec![SubscriberEvent::Next(Payload::from("c")), SubscriberEvent::Complete]
    );
    assert_eq!(pair.client.stream_count(), 0);
    assert_eq!(pair.server.stream_count(), 0);
}

#[test]
fn channel_echoes_until_both_sides_complete() {
    let mut pair = Pair::new(SetupParameters::default());
    let (subscriber, rx) = subscriber_channel();
    let handle = pair
        .client
        .request_channel(Payload::from("first"), 8, subscriber)
        .expect("channel should open");
    pair.pump();
    handle.next(Payload::from("second"));
    handle.complete();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while Instant::now() < deadline && !seen.contains(&SubscriberEvent::Complete) {
        pair.settle();
        seen.extend(events(&rx));
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        seen,
        vec![
            SubscriberEvent::Next(Payload::from("first")),
            SubscriberEvent::Next(Payload::from("second")),
            SubscriberEvent::Complete,
        ]
    );
    assert_eq!(pair.client.stream_count(), 0);
}

#[test]
fn fire_and_forget_and_metadata_push_reach_responder() {
    let mut pair = Pair::new(SetupParameters::default());
    pair.client
        .fire_and_forget(Payload::from("fnf"))
        .expect("fire-and-forget should send");
    pair.client
        .metadata_push(Bytes::from_static(b"routing"))
        .expect("metadata push should send");
    pair.pump();

    assert_eq!(
        *pair.responder.fire_and_forget.lock().expect("lock should not be poisoned"),
        vec![Payload::from("fnf")]
    );
    assert_eq!(
        *pair.responder.metadata.lock().expect("lock should not be poisoned"),
        vec![Bytes::from_static(b"routing")]
    );
    assert_eq!(pair.server.stream_count(), 0);
}

#[test]
fn large_payloads_are_fragmented_and_reassembled() {
    let mut pair = Pair::with_config(
        SetupParameters::default(),
        ConnectionConfig {
            max_fragment_size: 3,
            ..config(false)
        },
    );

    let (observer, result) = single_channel();
    pair.client
        .request_response(Payload::with_metadata("abcdefghij", "mmmmm"), observer)
        .expect("request should open");
    let fragments = pair.client_peer.take_frames();
    assert!(fragments.len() > 1, "request should be split");
    for fragment in &fragments[..fragments.len() - 1] {
        assert!(decode(fragment.clone()).header().flags.contains(FrameFlags::FOLLOWS));
    }
    assert!(!decode(fragments[fragments.len() - 1].clone())
        .header()
        .flags
        .contains(FrameFlags::FOLLOWS));
    for fragment in fragments {
        pair.server.process_frame(fragment);
    }
    pair.settle();
    assert_eq!(
        result.try_recv().expect("response should arrive"),
        Ok(Payload::with_metadata("abcdefghij", "mmmmm"))
    );

    let (subscriber, rx) = subscriber_channel();
    pair.client
        .request_stream(Payload::with_metadata("feed-request", "route"), 4, subscriber)
        .expect("stream should open");
    pair.pump();
    let producer = pair.responder.stream(0);
    producer.next(Payload::with_metadata("0123456789", "meta-data"));
    producer.next(Payload::from("tail"));
    producer.complete();
    pair.settle();

    assert_eq!(
        events(&rx),
        vec![
            SubscriberEvent::Next(Payload::with_metadata("0123456789", "meta-data")),
            SubscriberEvent::Next(Payload::from("tail")),
            SubscriberEvent::Complete,
        ]
    );
    assert_eq!(pair.client.stream_count(), 0);
    assert_eq!(pair.server.stream_count(), 0);
}

#[test]
fn warm_resume_replays_lost_frames_once() {
    let mut pair = Pair::new(SetupParameters::resumable());
    let (subscriber, rx) = subscriber_channel();
    pair.client
        .request_stream(Payload::from("feed"), 10, subscriber)
        .expect("stream should open");
    pair.pump();

    let producer = pair.responder.stream(0);
    producer.next(Payload::from("1"));
    producer.next(Payload::from("2"));
    pair.settle();

    // These never make it across.
    producer.next(Payload::from("3"));
    producer.next(Payload::from("4"));
    pair.server.handle_timeout(Instant::now());
    assert_eq!(pair.server_peer.take_frames().len(), 2);
    pair.client.disconnect("link dropped");
    pair.server.disconnect("link dropped");
    assert_eq!(pair.client.state(), ConnectionState::Disconnected);
    assert_eq!(pair.client.stream_count(), 1);

    let (client_transport, client_peer) = MemoryTransport::new();
    let (callback, status) = resume_status_channel();
    pair.client
        .resume_client(pair.setup.token.clone(), Box::new(client_transport), callback, ProtocolVersion::V1_0)
        .expect("resume should start");
    assert_eq!(pair.client.state(), ConnectionState::Resuming);

    let frames = client_peer.take_frames();
    let Frame::Resume(resume) = decode(frames[0].clone()) else {
        panic!("first frame should be RESUME");
    };
    let (server_transport, server_peer) = MemoryTransport::new();
    let resumed = pair
        .server
        .resume_server(Box::new(server_transport), ResumeParameters::from(resume))
        .expect("server should resume");
    assert!(resumed);

    pair.client_peer = client_peer;
    pair.server_peer = server_peer;
    producer.next(Payload::from("5"));
    producer.complete();
    pair.settle();

    assert_eq!(status.try_recv().expect("resume outcome should be reported"), Ok(()));
    assert_eq!(pair.client.state(), ConnectionState::Connected);
    let items: Vec<_> = events(&rx);
    assert_eq!(
        items,
        ["1", "2", "3", "4", "5"]
            .into_iter()
            .map(|item| SubscriberEvent::Next(Payload::from(item)))
            .chain(std::iter::once(SubscriberEvent::Complete))
            .collect::<Vec<_>>()
    );
}

#[test]
fn warm_resume_replays_lost_client_request_n_once() {
    let mut pair = Pair::new(SetupParameters::resumable());
    let (subscriber, rx) = subscriber_channel();
    let handle = pair
        .client
        .request_stream(Payload::from("feed"), 1, subscriber)
        .expect("stream should open");
    pair.pump();

    let producer = pair.responder.stream(0);
    for item in ["1", "2", "3", "4", "5"] {
        producer.next(Payload::from(item));
    }
    pair.settle();
    assert_eq!(events(&rx), vec![SubscriberEvent::Next(Payload::from("1"))]);

    // REQUEST_N(2) is written but lost with the link.
    handle.request(2);
    pair.client.handle_timeout(Instant::now());
    assert_eq!(pair.client_peer.take_frames().len(), 1);
    pair.client.disconnect("link dropped");
    pair.server.disconnect("link dropped");

    let (client_transport, client_peer) = MemoryTransport::new();
    let (callback, status) = resume_status_channel();
    pair.client
        .resume_client(pair.setup.token.clone(), Box::new(client_transport), callback, ProtocolVersion::V1_0)
        .expect("resume should start");
    let Frame::Resume(resume) = decode(client_peer.take_frames()[0].clone()) else {
        panic!("first frame should be RESUME");
    };
    let (server_transport, server_peer) = MemoryTransport::new();
    assert!(pair
        .server
        .resume_server(Box::new(server_transport), ResumeParameters::from(resume))
        .expect("server should resume"));

    pair.client_peer = client_peer;
    pair.server_peer = server_peer;
    pair.settle();
    pair.settle();

    assert_eq!(status.try_recv().expect("resume outcome should be reported"), Ok(()));
    assert_eq!(
        events(&rx),
        vec![SubscriberEvent::Next(Payload::from("2")), SubscriberEvent::Next(Payload::from("3"))]
    );
    assert_eq!(pair.client.stream_count(), 1);
}

#[test]
fn server_rejects_resume_from_unknown_position() {
    let mut pair = Pair::new(SetupParameters::resumable());
    pair.server.disconnect("link dropped");
    let (server_transport, server_peer) = MemoryTransport::new();
    let resumed = pair
        .server
        .resume_server(
            Box::new(server_transport),
            ResumeParameters {
                token: pair.setup.token.clone(),
                server_position: 4096,
                client_position: 0,
                version: ProtocolVersion::V1_0,
            },
        )
        .expect("resume should be attempted");
    assert!(!resumed);
    assert!(pair.server.is_closed());

    let frames = server_peer.take_frames();
    let Frame::Error(error) = decode(frames[0].clone()) else {
        panic!("server should answer with ERROR");
    };
    assert_eq!(error.code, ErrorCode::RejectedResume);
}

#[test]
fn stream_frame_while_resuming_closes_connection() {
    let mut pair = Pair::new(SetupParameters::resumable());
    pair.client.disconnect("link dropped");
    let (client_transport, _client_peer) = MemoryTransport::new();
    let (callback, status) = resume_status_channel();
    pair.client
        .resume_client(pair.setup.token.clone(), Box::new(client_transport), callback, ProtocolVersion::V1_0)
        .expect("resume should start");

    pair.client.process_frame(next_item(1, "early"));
    assert!(pair.client.is_closed());
    assert!(status.try_recv().expect("failure should be reported").is_err());
}

#[test]
fn request_with_wrong_parity_is_a_connection_error() {
    let mut pair = Pair::new(SetupParameters::default());
    pair.server.process_frame(encode(Frame::Request(RequestFrame::new(
        FrameType::RequestResponse,
        2,
        FrameFlags::empty(),
        0,
        Payload::from("bad"),
    ))));
    assert!(pair.server.is_closed());
    assert!(pair.server_peer.is_closed());

    let frames = pair.server_peer.take_frames();
    let Frame::Error(error) = decode(frames.last().cloned().expect("ERROR should be written")) else {
        panic!("last frame should be ERROR");
    };
    assert_eq!(error.header.stream_id, 0);
    assert_eq!(error.code, ErrorCode::ConnectionError);
}

#[test]
fn request_reusing_an_older_stream_id_is_a_connection_error() {
    let mut pair = Pair::new(SetupParameters::default());
    pair.server.process_frame(encode(Frame::Request(RequestFrame::new(
        FrameType::RequestFnf,
        3,
        FrameFlags::empty(),
        0,
        Payload::from("first"),
    ))));
    assert!(!pair.server.is_closed());
    assert_eq!(pair.responder.fire_and_forget.lock().expect("lock should not be poisoned").len(), 1);

    pair.server.process_frame(encode(Frame::Request(RequestFrame::new(
        FrameType::RequestResponse,
        1,
        FrameFlags::empty(),
        0,
        Payload::from("stale"),
    ))));
    assert!(pair.server.is_closed());
    assert_eq!(pair.server.stream_count(), 0);

    let frames = pair.server_peer.take_frames();
    let Frame::Error(error) = decode(frames.last().cloned().expect("ERROR should be written")) else {
        panic!("last frame should be ERROR");
    };
    assert_eq!(error.header.stream_id, 0);
    assert_eq!(error.code, ErrorCode::ConnectionError);
}

#[test]
fn frames_for_unknown_streams_are_ignored() {
    let mut pair = Pair::new(SetupParameters::default());
    pair.client.process_frame(next_item(41, "stray"));
    assert!(!pair.client.is_closed());
    assert!(pair.client_peer.take_frames().is_empty());
}

#[test]
fn requests_fail_fast_when_not_connected() {
    let mut machine = RSocketStateMachine::new(ConnectionRole::Initiator, config(false), Box::new(TestResponder::default()));
    let (observer, result) = single_channel();
    assert!(machine.request_response(Payload::from("x"), observer).is_none());
    assert_eq!(result.try_recv().expect("error should be reported"), Err(StreamError::Unavailable));
    assert!(matches!(
        machine.fire_and_forget(Payload::from("x")),
        Err(RSocketError::Disconnected)
    ));

    machine.close("done", StreamCompletionSignal::ConnectionEnd);
    assert!(matches!(
        machine.metadata_push(Bytes::from_static(b"m")),
        Err(RSocketError::Closed)
    ));
}

#[derive(Clone, Default)]
struct CountingEvents {
    closed: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
}

impl ConnectionEvents for CountingEvents {
    fn on_disconnected(&mut self, _reason: &str) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&mut self, _reason: &str) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn close_is_idempotent_and_interrupts_streams() {
    let events_hook = CountingEvents::default();
    let mut machine = RSocketStateMachine::new(ConnectionRole::Initiator, config(false), Box::new(TestResponder::default()))
        .with_events(Box::new(events_hook.clone()));
    let (transport, peer) = MemoryTransport::new();
    machine
        .connect_client(Box::new(transport), SetupParameters::default())
        .expect("client should connect");
    let (subscriber, rx) = subscriber_channel();
    machine
        .request_stream(Payload::from("feed"), 1, subscriber)
        .expect("stream should open");

    machine.close("shutting down", StreamCompletionSignal::ConnectionEnd);
    machine.close("again", StreamCompletionSignal::ConnectionError);
    drop(machine);

    assert_eq!(events_hook.closed.load(Ordering::SeqCst), 1);
    assert!(peer.is_closed());
    assert_eq!(
        events(&rx),
        vec![SubscriberEvent::Error(StreamError::Interrupted(StreamCompletionSignal::ConnectionEnd))]
    );
}

#[test]
fn unanswered_keepalive_closes_connection() {
    let mut machine = RSocketStateMachine::new(ConnectionRole::Initiator, config(true), Box::new(TestResponder::default()));
    let (transport, peer) = MemoryTransport::new();
    let setup = SetupParameters {
        keepalive_interval: Duration::from_millis(100),
        ..SetupParameters::default()
    };
    machine
        .connect_client(Box::new(transport), setup)
        .expect("client should connect");
    peer.take_frames();
    assert!(machine.next_timeout().is_some());

    machine.handle_timeout(Instant::now() + Duration::from_secs(1));
    let frames = peer.take_frames();
    let Frame::Keepalive(keepalive) = decode(frames[0].clone()) else {
        panic!("timer should send KEEPALIVE");
    };
    assert!(keepalive.respond());
    assert!(!machine.is_closed());

    machine.handle_timeout(Instant::now() + Duration::from_secs(2));
    assert!(machine.is_closed());
    let Frame::Error(error) = decode(peer.take_frames()[0].clone()) else {
        panic!("timeout should send ERROR");
    };
    assert_eq!(error.code, ErrorCode::ConnectionError);
}

#[test]
fn answered_keepalive_keeps_connection_open() {
    let mut pair = Pair::new(SetupParameters {
        keepalive_interval: Duration::from_millis(100),
        ..SetupParameters::default()
    });
    // Pair disables keepalives on both ends; rebuild the client with them on.
    let mut client = RSocketStateMachine::new(ConnectionRole::Initiator, config(true), Box::new(TestResponder::default()));
    let (transport, peer) = MemoryTransport::new();
    client
        .connect_client(Box::new(transport), pair.setup.clone())
        .expect("client should connect");
    peer.take_frames();
    pair.client = client;
    pair.client_peer = peer;

    for round in 1..=3u64 {
        pair.client
            .handle_timeout(Instant::now() + Duration::from_secs(round));
        pair.pump();
        assert!(!pair.client.is_closed(), "round {round} should stay open");
    }
}

/// Records resumed stream tokens and hands out channel subscribers.
struct Rebuilder {
    resumed: Arc<Mutex<Vec<(String, u32)>>>,
    subscribers: mpsc::Sender<mpsc::Receiver<SubscriberEvent>>,
}

impl ColdResumeHandler for Rebuilder {
    fn handle_requester_resume_stream(&mut self, token: &str, consumer_allowance: u32) -> Option<Box<dyn Subscriber>> {
        self.resumed
            .lock()
            .expect("lock should not be poisoned")
            .push((token.to_string(), consumer_allowance));
        let (subscriber, rx) = subscriber_channel();
        let _ = self.subscribers.send(rx);
        Some(subscriber)
    }
}

#[test]
fn cold_resume_rebuilds_requester_streams_from_snapshot() {
    let (subscribers_tx, subscribers_rx) = mpsc::channel();
    let resumed = Arc::new(Mutex::new(Vec::new()));
    let setup = SetupParameters::resumable();

    let snapshot = {
        let mut first = RSocketStateMachine::new(ConnectionRole::Initiator, config(false), Box::new(TestResponder::default()))
            .with_cold_resume_handler(Box::new(Rebuilder {
                resumed: Arc::new(Mutex::new(Vec::new())),
                subscribers: subscribers_tx.clone(),
            }));
        let (transport, _peer) = MemoryTransport::new();
        first
            .connect_client(Box::new(transport), setup.clone())
            .expect("client should connect");
        let (subscriber, _rx) = subscriber_channel();
        first
            .request_stream(Payload::from("feed"), 4, subscriber)
            .expect("stream should open");
        first.process_frame(next_item(1, "one"));
        let json = first.resume_snapshot().to_json().expect("snapshot should serialize");
        ResumeSnapshot::from_json(&json).expect("snapshot should parse")
    };
    assert_eq!(snapshot.streams[&1].token, "1");
    assert_eq!(snapshot.streams[&1].consumer_allowance, 3);
    let last_sent = snapshot.last_sent_position;

    let mut second = RSocketStateMachine::new(ConnectionRole::Initiator, config(false), Box::new(TestResponder::default()))
        .with_resume_manager(Box::new(WarmResumeManager::from_snapshot(snapshot)))
        .with_cold_resume_handler(Box::new(Rebuilder {
            resumed: Arc::clone(&resumed),
            subscribers: subscribers_tx,
        }));
    let (transport, peer) = MemoryTransport::new();
    let (callback, status) = resume_status_channel();
    second
        .resume_client(setup.token.clone(), Box::new(transport), callback, ProtocolVersion::V1_0)
        .expect("cold resume should start");
    let Frame::Resume(resume) = decode(peer.take_frames()[0].clone()) else {
        panic!("first frame should be RESUME");
    };
    assert_eq!(resume.token, setup.token);

    second.process_frame(encode(Frame::ResumeOk(ResumeOkFrame::new(last_sent))));
    assert_eq!(status.try_recv().expect("resume outcome should be reported"), Ok(()));
    assert_eq!(
        *resumed.lock().expect("lock should not be poisoned"),
        vec![("1".to_string(), 3)]
    );
    assert!(second.has_stream(1));

    let rx = subscribers_rx.try_iter().last().expect("rebuilt stream should have a subscriber");
    second.process_frame(next_item(1, "two"));
    assert_eq!(events(&rx), vec![SubscriberEvent::Next(Payload::from("two"))]);

    let (observer, _result) = single_channel();
    let handle = second
        .request_response(Payload::from("after"), observer)
        .expect("request should open");
    assert_eq!(handle.stream_id(), 3);
}

#[test]
fn resume_ledger_tracks_requester_allowance() {
    let mut machine = RSocketStateMachine::new(ConnectionRole::Initiator, config(false), Box::new(TestResponder::default()))
        .with_cold_resume_handler(Box::new(Rebuilder {
            resumed: Arc::new(Mutex::new(Vec::new())),
            subscribers: mpsc::channel().0,
        }));
    let (transport, _peer) = MemoryTransport::new();
    machine
        .connect_client(Box::new(transport), SetupParameters::resumable())
        .expect("client should connect");
    let (subscriber, rx) = subscriber_channel();
    machine
        .request_stream(Payload::from("feed"), 4, subscriber)
        .expect("stream should open");
    let allowance = |machine: &RSocketStateMachine| machine.resume_snapshot().streams[&1].consumer_allowance;
    assert_eq!(allowance(&machine), 4);

    machine.process_frame(next_item(1, "one"));
    assert_eq!(allowance(&machine), 3);

    machine.signal(1, StreamSignal::Request(5));
    assert_eq!(allowance(&machine), 8);
    assert_eq!(events(&rx), vec![SubscriberEvent::Next(Payload::from("one"))]);
}

#[test]
fn cold_resume_rebuilds_stream_that_received_nothing() {
    let (subscribers_tx, subscribers_rx) = mpsc::channel();
    let resumed = Arc::new(Mutex::new(Vec::new()));
    let setup = SetupParameters::resumable();

    let snapshot = {
        let mut first = RSocketStateMachine::new(ConnectionRole::Initiator, config(false), Box::new(TestResponder::default()))
            .with_cold_resume_handler(Box::new(Rebuilder {
                resumed: Arc::new(Mutex::new(Vec::new())),
                subscribers: subscribers_tx.clone(),
            }));
        let (transport, _peer) = MemoryTransport::new();
        first
            .connect_client(Box::new(transport), setup.clone())
            .expect("client should connect");
        let (subscriber, _rx) = subscriber_channel();
        first
            .request_stream(Payload::from("feed"), 2, subscriber)
            .expect("stream should open");
        first.resume_snapshot()
    };
    assert_eq!(snapshot.streams[&1].consumer_allowance, 2);
    let last_sent = snapshot.last_sent_position;

    let mut second = RSocketStateMachine::new(ConnectionRole::Initiator, config(false), Box::new(TestResponder::default()))
        .with_resume_manager(Box::new(WarmResumeManager::from_snapshot(snapshot)))
        .with_cold_resume_handler(Box::new(Rebuilder {
            resumed: Arc::clone(&resumed),
            subscribers: subscribers_tx,
        }));
    let (transport, _peer) = MemoryTransport::new();
    let (callback, status) = resume_status_channel();
    second
        .resume_client(setup.token.clone(), Box::new(transport), callback, ProtocolVersion::V1_0)
        .expect("cold resume should start");
    second.process_frame(encode(Frame::ResumeOk(ResumeOkFrame::new(last_sent))));
    assert_eq!(status.try_recv().expect("resume outcome should be reported"), Ok(()));
    assert_eq!(
        *resumed.lock().expect("lock should not be poisoned"),
        vec![("1".to_string(), 2)]
    );

    let rx = subscribers_rx.try_iter().last().expect("rebuilt stream should have a subscriber");
    second.process_frame(next_item(1, "a"));
    second.process_frame(next_item(1, "b"));
    assert_eq!(
        events(&rx),
        vec![SubscriberEvent::Next(Payload::from("a")), SubscriberEvent::Next(Payload::from("b"))]
    );
    assert!(!second.is_closed());
}

#[test]
fn cold_resume_requires_a_handler() {
    let mut machine = RSocketStateMachine::new(ConnectionRole::Initiator, config(false), Box::new(TestResponder::default()));
    let (transport, _peer) = MemoryTransport::new();
    let (callback, _status) = resume_status_channel();
    let err = machine
        .resume_client(
            SetupParameters::resumable().token,
            Box::new(transport),
            callback,
            ProtocolVersion::V1_0,
        )
        .expect_err("cold resume without handler should fail");
    assert!(matches!(err, RSocketError::ColdResumeUnavailable));
}
