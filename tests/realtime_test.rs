//! End-to-end tests of the realtime channel over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use consultation_confidence::config::{GateConfig, RealtimeConfig, SessionConfig};
use consultation_confidence::gate::GateStatus;
use consultation_confidence::history::WorkflowPhase;
use consultation_confidence::error::{ChannelError, ValidationResult};
use consultation_confidence::realtime::{
    ChunkPayload, ClientMessage, ConnectionState, Envelope, ErrorKind, ErrorPayload, EventType,
    HelloPayload, PhaseChangePayload, ProgressPayload, RealtimeClient, RealtimeServer, ReconnectPolicy,
    WorkflowUpdatePayload,
};
use consultation_confidence::scoring::{
    ConfidenceFactors, ConfidenceScore, ScoringInput, UncertaintyInput,
};
use consultation_confidence::session::{SessionManager, SessionSnapshot};
use consultation_confidence::storage::SqliteStorage;
use consultation_confidence::validation::{KnowledgeSource, SourceKind, SourceRequest};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    manager: Arc<SessionManager>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(Vec::new()).await
    }

    async fn start_with(sources: Vec<Arc<dyn KnowledgeSource>>) -> Self {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let manager = Arc::new(SessionManager::new(
            Arc::new(storage),
            sources,
            &GateConfig {
                max_clarification_attempts: 3,
            },
            &SessionConfig { queue_capacity: 16 },
        ));
        let config = RealtimeConfig {
            heartbeat_interval_secs: 1,
            reconnect_base_delay_ms: 10,
            reconnect_max_attempts: 3,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RealtimeServer::new(manager.clone(), config);
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            manager,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    fn client(&self) -> RealtimeClient {
        RealtimeClient::new(
            self.addr.to_string(),
            ReconnectPolicy::new(Duration::from_millis(10), 3),
        )
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        }
    }
}

fn example_factors() -> ConfidenceFactors {
    ConfidenceFactors::new(0.95, 0.97, 0.98, 0.94, 0.96, 0.95)
}

fn unsure_input() -> ScoringInput {
    ScoringInput::new(example_factors()).with_uncertainty(UncertaintyInput::new(
        vec!["hosting budget".to_string(), "peak load".to_string()],
        Vec::new(),
    ))
}

/// Knowledge source that answers only after `delay`.
struct SlowSource {
    delay: Duration,
    score: f64,
}

#[async_trait]
impl KnowledgeSource for SlowSource {
    fn kind(&self) -> SourceKind {
        SourceKind::KnowledgeBase
    }

    async fn score(&self, _request: &SourceRequest) -> ValidationResult<f64> {
        tokio::time::sleep(self.delay).await;
        Ok(self.score)
    }
}

type RawLines = tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>;

type RawWriter = tokio::net::tcp::OwnedWriteHalf;

/// Raw connection that has sent `hello` and nothing else.
async fn raw_hello(addr: SocketAddr, session_id: Option<&str>) -> (RawLines, RawWriter) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let hello = ClientMessage::Hello(HelloPayload {
        session_id: session_id.map(str::to_string),
    });
    writer
        .write_all(hello.to_line().unwrap().as_bytes())
        .await
        .unwrap();
    (BufReader::new(reader).lines(), writer)
}

/// Next non-heartbeat envelope, `None` once the server hangs up.
async fn read_envelope(lines: &mut RawLines) -> Option<Envelope> {
    loop {
        let line = tokio::time::timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()?;
        let envelope: Envelope = serde_json::from_str(&line).unwrap();
        if envelope.event_type != EventType::Heartbeat {
            return Some(envelope);
        }
    }
}

#[tokio::test]
async fn test_handshake_delivers_fresh_snapshot() {
    let server = TestServer::start().await;
    let mut client = server.client();

    let session = client.connect().await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, WorkflowPhase::Requirements);
    assert_eq!(snapshot.gate_status, GateStatus::Active);
    assert_eq!(snapshot.max_attempts, 3);
    assert!(snapshot.score.is_none());
    assert!(snapshot.history.is_empty());
    assert_eq!(
        session.connection().session_id(),
        Some(snapshot.session_id.as_str())
    );
    assert_eq!(session.connection().state(), ConnectionState::Connected);
    assert_eq!(server.manager.session_count().await, 1);

    drop(session);
    assert_eq!(client.connection().state(), ConnectionState::Disconnected);
    server.stop().await;
}

#[tokio::test]
async fn test_submit_and_advance_stream_events() {
    let server = TestServer::start().await;
    let mut client = server.client();
    let mut session = client.connect().await.unwrap();

    session
        .send(&ClientMessage::SubmitInput(ScoringInput::new(example_factors())))
        .await
        .unwrap();
    let update = session.wait_for(EventType::ConfidenceUpdate).await.unwrap();
    let score: ConfidenceScore = update.payload_as().unwrap();
    assert!((score.overall_confidence() - 0.9595).abs() < 1e-9);
    assert!(score.meets_baseline());

    session.send(&ClientMessage::Advance).await.unwrap();
    let change: PhaseChangePayload = session
        .wait_for(EventType::PhaseChange)
        .await
        .unwrap()
        .payload_as()
        .unwrap();
    assert_eq!(change.from, WorkflowPhase::Requirements);
    assert_eq!(change.to, WorkflowPhase::Architecture);

    let progress: ProgressPayload = session
        .wait_for(EventType::ProgressUpdate)
        .await
        .unwrap()
        .payload_as()
        .unwrap();
    assert_eq!(progress.phase_index, 1);
    assert_eq!(progress.percent, 25.0);

    drop(session);
    server.stop().await;
}

#[tokio::test]
async fn test_blocked_advance_reports_actions() {
    let server = TestServer::start().await;
    let mut client = server.client();
    let mut session = client.connect().await.unwrap();

    session
        .send(&ClientMessage::SubmitInput(unsure_input()))
        .await
        .unwrap();
    let score: ConfidenceScore = session
        .wait_for(EventType::ConfidenceUpdate)
        .await
        .unwrap()
        .payload_as()
        .unwrap();
    assert!(!score.meets_baseline());

    session.send(&ClientMessage::Advance).await.unwrap();
    let update: WorkflowUpdatePayload = session
        .wait_for(EventType::WorkflowUpdate)
        .await
        .unwrap()
        .payload_as()
        .unwrap();
    assert_eq!(update.status, GateStatus::AwaitingClarification);
    assert_eq!(update.attempt, 1);
    assert_eq!(update.max_attempts, 3);
    assert!(update
        .recommended_actions
        .iter()
        .any(|a| a.contains("peak load")));

    session
        .send(&ClientMessage::RequestClarification)
        .await
        .unwrap();
    let clarification: WorkflowUpdatePayload = session
        .wait_for(EventType::WorkflowUpdate)
        .await
        .unwrap()
        .payload_as()
        .unwrap();
    assert_eq!(clarification.recommended_actions, update.recommended_actions);

    // A clarified answer is re-scored and the gate retries on its own.
    session
        .send(&ClientMessage::SubmitInput(ScoringInput::new(example_factors())))
        .await
        .unwrap();
    let change: PhaseChangePayload = session
        .wait_for(EventType::PhaseChange)
        .await
        .unwrap()
        .payload_as()
        .unwrap();
    assert_eq!(change.to, WorkflowPhase::Architecture);

    drop(session);
    server.stop().await;
}

#[tokio::test]
async fn test_streamed_chunks_reach_client() {
    let server = TestServer::start().await;
    let mut client = server.client();
    let mut session = client.connect().await.unwrap();
    let handle = server
        .manager
        .get(&session.snapshot().session_id)
        .await
        .unwrap();

    for (seq, content) in [(1, "Use "), (2, "Postgres"), (2, "Postgres"), (3, ".")] {
        handle.apply_chunk("m1", seq, content).await.unwrap();
    }
    let finalized = handle.complete_message("m1").await.unwrap().unwrap();
    assert_eq!(finalized.content_so_far, "Use Postgres.");

    let mut sequences = Vec::new();
    loop {
        let envelope = session.next_event_within(WAIT).await.unwrap().unwrap();
        match envelope.event_type {
            EventType::AiResponseChunk => {
                let chunk: ChunkPayload = envelope.payload_as().unwrap();
                sequences.push(chunk.sequence);
            }
            EventType::AiResponseComplete => break,
            _ => continue,
        }
    }
    // The duplicate is not re-broadcast.
    assert_eq!(sequences, vec![1, 2, 3]);

    drop(session);
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_resumes_session_with_history() {
    let server = TestServer::start().await;
    let mut client = server.client();

    let mut session = client.connect().await.unwrap();
    let session_id = session.snapshot().session_id.clone();
    session
        .send(&ClientMessage::SubmitInput(unsure_input()))
        .await
        .unwrap();
    session.wait_for(EventType::ConfidenceUpdate).await.unwrap();
    drop(session);

    assert_eq!(client.connection().state(), ConnectionState::Disconnected);
    let session = client.connect().await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.session_id, session_id);
    assert_eq!(snapshot.history.len(), 1);
    assert!((snapshot.history[0].confidence - 0.8995).abs() < 1e-9);
    assert!(snapshot.score.is_some());
    assert_eq!(server.manager.session_count().await, 1);

    drop(session);
    server.stop().await;
}

#[tokio::test]
async fn test_server_sends_heartbeats() {
    let server = TestServer::start().await;
    let mut client = server.client();
    let mut session = client.connect().await.unwrap();

    let envelope = session.next_event_within(WAIT).await.unwrap().unwrap();
    assert_eq!(envelope.event_type, EventType::Heartbeat);
    session.heartbeat().await.unwrap();

    drop(session);
    server.stop().await;
}

#[tokio::test]
async fn test_first_message_must_be_hello() {
    let server = TestServer::start().await;
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(ClientMessage::Advance.to_line().unwrap().as_bytes())
        .await
        .unwrap();

    let envelope = read_envelope(&mut lines).await.unwrap();
    assert_eq!(envelope.event_type, EventType::Error);
    let error: ErrorPayload = envelope.payload_as().unwrap();
    assert_eq!(error.kind, ErrorKind::HandshakeRequired);

    // The server hangs up after rejecting the handshake.
    assert!(read_envelope(&mut lines).await.is_none());
    assert_eq!(server.manager.session_count().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_message_keeps_connection_open() {
    let server = TestServer::start().await;
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"{\"type\":\"hello\",\"payload\":{}}\n")
        .await
        .unwrap();
    let ack = read_envelope(&mut lines).await.unwrap();
    assert_eq!(ack.event_type, EventType::ConnectionAck);

    writer.write_all(b"{not json\n").await.unwrap();
    let envelope = read_envelope(&mut lines).await.unwrap();
    let error: ErrorPayload = envelope.payload_as().unwrap();
    assert_eq!(error.kind, ErrorKind::MalformedMessage);

    writer
        .write_all(b"{\"type\":\"launch_rockets\"}\n")
        .await
        .unwrap();
    let error: ErrorPayload = read_envelope(&mut lines)
        .await
        .unwrap()
        .payload_as()
        .unwrap();
    assert_eq!(error.kind, ErrorKind::MalformedMessage);

    // Still usable afterwards.
    writer
        .write_all(ClientMessage::Advance.to_line().unwrap().as_bytes())
        .await
        .unwrap();
    let error: ErrorPayload = read_envelope(&mut lines)
        .await
        .unwrap()
        .payload_as()
        .unwrap();
    assert_eq!(error.kind, ErrorKind::InvalidInput);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_session_rejected() {
    let server = TestServer::start().await;
    let mut client = server.client().with_session("no-such-session");

    let err = client.connect().await.err().unwrap();
    assert!(matches!(
        err,
        ChannelError::ReconnectExhausted { attempts: 3 }
    ));
    assert_eq!(server.manager.session_count().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_close_ends_connection() {
    let server = TestServer::start().await;
    let mut client = server.client();
    let mut session = client.connect().await.unwrap();

    session.send(&ClientMessage::Close).await.unwrap();
    while let Some(envelope) = session.next_event_within(WAIT).await.unwrap() {
        assert_ne!(envelope.event_type, EventType::ConfidenceUpdate);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_slow_validation_does_not_stall_heartbeats() {
    let source: Arc<dyn KnowledgeSource> = Arc::new(SlowSource {
        delay: Duration::from_secs(3),
        score: 0.97,
    });
    let server = TestServer::start_with(vec![source]).await;
    let mut client = server.client();
    let mut session = client.connect().await.unwrap();

    session
        .send(&ClientMessage::SubmitInput(ScoringInput::new(example_factors())))
        .await
        .unwrap();

    // Two heartbeat intervals is the dead-connection threshold.
    let dead_after = Duration::from_secs(2);
    let mut heartbeats = 0;
    let score: ConfidenceScore = loop {
        let envelope = session.next_event_within(dead_after).await.unwrap().unwrap();
        match envelope.event_type {
            EventType::Heartbeat => heartbeats += 1,
            EventType::ConfidenceUpdate => break envelope.payload_as().unwrap(),
            other => panic!("unexpected {}", other),
        }
    };
    assert!(heartbeats >= 2, "only {} heartbeats while validating", heartbeats);
    assert!((score.overall_confidence() - 0.97).abs() < 1e-9);
    assert_eq!(session.connection().state(), ConnectionState::Connected);

    drop(session);
    server.stop().await;
}

#[tokio::test]
async fn test_silent_client_is_dropped_and_can_resume() {
    let server = TestServer::start().await;
    let (mut lines, writer) = raw_hello(server.addr, None).await;
    let ack = read_envelope(&mut lines).await.unwrap();
    assert_eq!(ack.event_type, EventType::ConnectionAck);
    let session_id = ack.payload_as::<SessionSnapshot>().unwrap().session_id;

    // Heartbeats keep coming, but the client never answers.
    let started = Instant::now();
    let mut heartbeats = 0;
    loop {
        let line = tokio::time::timeout_at(started + Duration::from_secs(4), lines.next_line())
            .await
            .expect("server kept a silent client")
            .unwrap();
        let Some(line) = line else { break };
        let envelope: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(envelope.event_type, EventType::Heartbeat);
        heartbeats += 1;
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1900), "dropped after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "dropped after {:?}", elapsed);
    assert!(heartbeats >= 1);
    drop(writer);

    // The session outlives the connection.
    let (mut lines, _writer) = raw_hello(server.addr, Some(&session_id)).await;
    let ack = read_envelope(&mut lines).await.unwrap();
    assert_eq!(ack.event_type, EventType::ConnectionAck);
    assert_eq!(ack.payload_as::<SessionSnapshot>().unwrap().session_id, session_id);
    assert_eq!(server.manager.session_count().await, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_client_heartbeats_keep_connection_open() {
    let server = TestServer::start().await;
    let mut client = server.client();
    let mut session = client.connect().await.unwrap();

    // Well past the 2s threshold; the client answers every server heartbeat.
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(3) {
        let envelope = session
            .next_event_within(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("server hung up on a live client");
        assert_eq!(envelope.event_type, EventType::Heartbeat);
    }

    drop(session);
    server.stop().await;
}
