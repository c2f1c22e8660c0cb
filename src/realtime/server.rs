use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::envelope::{ClientMessage, Envelope, ErrorKind, EventType, WorkflowUpdatePayload};
use crate::config::RealtimeConfig;
use crate::error::{
    ChannelError, ChannelResult, GateError, PipelineError, SessionError, SessionResult,
};
use crate::session::{SessionHandle, SessionManager, SessionSnapshot};

/// Session requests one connection may have queued or running.
const PENDING_REQUESTS: usize = 32;

/// TCP endpoint of the realtime channel.
///
/// One connection carries exactly one session. Frames are newline-delimited
/// JSON; the first client frame must be `hello`.
#[derive(Clone)]
pub struct RealtimeServer {
    manager: Arc<SessionManager>,
    config: RealtimeConfig,
}

impl RealtimeServer {
    /// Create a new server
    pub fn new(manager: Arc<SessionManager>, config: RealtimeConfig) -> Self {
        Self { manager, config }
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> ChannelResult<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "Realtime server listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            warn!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
            }
        }

        self.manager.shutdown().await;
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> ChannelResult<()> {
        debug!(peer = %peer, "Connection accepted");
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let handle = match self.handshake(&mut lines, &mut writer).await? {
            Some(handle) => handle,
            None => return Ok(()),
        };

        let (snapshot, events) = match handle.attach().await {
            Ok(attached) => attached,
            Err(e) => {
                send_error(&mut writer, &e).await?;
                return Ok(());
            }
        };
        write_envelope(&mut writer, &Envelope::new(EventType::ConnectionAck, &snapshot)?).await?;
        info!(peer = %peer, session_id = %handle.session_id(), "Client attached");

        // Session requests run on their own task so a slow worker never
        // holds up heartbeats or event forwarding.
        let (requests, queue) = mpsc::channel(PENDING_REQUESTS);
        let (replies, outbound) = mpsc::channel(PENDING_REQUESTS);
        let requester = tokio::spawn(run_requests(handle.clone(), queue, replies));

        let result = self
            .pump(&mut lines, &mut writer, &handle, events, &requests, outbound)
            .await;
        requester.abort();
        result
    }

    /// Connection loop: inbound frames, outbound replies, session events,
    /// heartbeats and the idle deadline.
    async fn pump<R, W>(
        &self,
        lines: &mut Lines<R>,
        writer: &mut W,
        handle: &SessionHandle,
        events: broadcast::Receiver<Envelope>,
        requests: &mpsc::Sender<ClientMessage>,
        mut outbound: mpsc::Receiver<Envelope>,
    ) -> ChannelResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let session_id = handle.session_id();
        let period = self.config.heartbeat_interval();
        let dead_after = self.config.dead_after();

        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle = sleep(dead_after);
        tokio::pin!(idle);

        let mut events = Some(events);
        let mut resync: Option<PendingAttach> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!(session_id = %session_id, "Client disconnected");
                        break;
                    };
                    idle.as_mut().reset(Instant::now() + dead_after);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if !self.route(line, handle, requests, writer).await? {
                        break;
                    }
                }
                Some(reply) = outbound.recv() => write_envelope(writer, &reply).await?,
                event = next_event(&mut events) => match event {
                    Ok(envelope) => write_envelope(writer, &envelope).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        // Events still buffered are covered by the fresh snapshot.
                        warn!(session_id = %session_id, skipped, "Subscriber lagged, re-attaching");
                        events = None;
                        let handle = handle.clone();
                        resync = Some(Box::pin(async move { handle.attach().await }));
                    }
                    Err(RecvError::Closed) => {
                        let envelope = Envelope::error(
                            ErrorKind::SessionClosed,
                            format!("Session closed: {}", session_id),
                        );
                        write_envelope(writer, &envelope).await?;
                        break;
                    }
                },
                attached = attach_done(&mut resync) => {
                    resync = None;
                    match attached {
                        Ok((snapshot, receiver)) => {
                            let ack = Envelope::new(EventType::ConnectionAck, &snapshot)?;
                            write_envelope(writer, &ack).await?;
                            events = Some(receiver);
                        }
                        Err(e) => {
                            send_error(writer, &e).await?;
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => write_envelope(writer, &Envelope::heartbeat()).await?,
                _ = &mut idle => {
                    warn!(
                        session_id = %session_id,
                        idle_secs = dead_after.as_secs(),
                        "No traffic from client, dropping dead connection"
                    );
                    return Err(ChannelError::DeadConnection {
                        idle_secs: dead_after.as_secs(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Read `hello`, open or resume the session. `None` when the client was
    /// rejected (an error envelope has been sent).
    async fn handshake(
        &self,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
        writer: &mut OwnedWriteHalf,
    ) -> ChannelResult<Option<SessionHandle>> {
        let first = timeout(self.config.dead_after(), lines.next_line())
            .await
            .map_err(|_| ChannelError::Handshake {
                message: "timed out waiting for hello".to_string(),
            })??;
        let Some(first) = first else {
            return Err(ChannelError::Handshake {
                message: "connection closed before hello".to_string(),
            });
        };

        let hello = match ClientMessage::parse(first.trim()) {
            Ok(ClientMessage::Hello(hello)) => hello,
            Ok(_) => {
                let envelope = Envelope::error(
                    ErrorKind::HandshakeRequired,
                    "first message must be hello",
                );
                write_envelope(writer, &envelope).await?;
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "Malformed handshake");
                write_envelope(writer, &Envelope::error(ErrorKind::MalformedMessage, e.to_string()))
                    .await?;
                return Ok(None);
            }
        };

        match self.manager.open(hello.session_id.as_deref()).await {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                send_error(writer, &e).await?;
                Ok(None)
            }
        }
    }

    /// Handle one inbound frame. Session requests are queued for the
    /// requester task. Returns `false` when the connection should end.
    async fn route<W: AsyncWrite + Unpin>(
        &self,
        line: &str,
        handle: &SessionHandle,
        requests: &mpsc::Sender<ClientMessage>,
        writer: &mut W,
    ) -> ChannelResult<bool> {
        let message = match ClientMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %handle.session_id(), error = %e, "Dropping malformed message");
                write_envelope(writer, &Envelope::error(ErrorKind::MalformedMessage, e.to_string()))
                    .await?;
                return Ok(true);
            }
        };

        match message {
            ClientMessage::Heartbeat => {}
            ClientMessage::Hello(_) => {
                let envelope = Envelope::error(
                    ErrorKind::ProtocolError,
                    "session already established on this connection",
                );
                write_envelope(writer, &envelope).await?;
            }
            ClientMessage::Close => {
                if let Err(e) = self.manager.close(handle.session_id()).await {
                    debug!(error = %e, "Close for a session that is no longer live");
                }
                return Ok(false);
            }
            request => match requests.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(session_id = %handle.session_id(), "Too many requests in flight");
                    let envelope = Envelope::error(
                        ErrorKind::ProtocolError,
                        format!("more than {} requests in flight", PENDING_REQUESTS),
                    );
                    write_envelope(writer, &envelope).await?;
                }
                Err(TrySendError::Closed(_)) => return Ok(false),
            },
        }

        Ok(true)
    }
}

/// Run one connection's session requests in arrival order. Errors and
/// direct replies go back through `replies`; everything else reaches the
/// client as session events.
async fn run_requests(
    handle: SessionHandle,
    mut requests: mpsc::Receiver<ClientMessage>,
    replies: mpsc::Sender<Envelope>,
) {
    while let Some(request) = requests.recv().await {
        let reply = match request {
            ClientMessage::SubmitInput(input) => {
                handle.submit_input(input).await.err().map(|e| error_envelope(&e))
            }
            ClientMessage::Advance => handle.advance().await.err().map(|e| error_envelope(&e)),
            ClientMessage::RequestClarification => clarification(&handle).await,
            other => {
                debug!(message = ?other, "Not a session request");
                None
            }
        };
        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }
}

/// `workflow_update` carrying the recommended actions, or the error.
async fn clarification(handle: &SessionHandle) -> Option<Envelope> {
    let result = match handle.request_clarification().await {
        Ok(actions) => handle.snapshot().await.map(|s| (actions, s)),
        Err(e) => Err(e),
    };
    match result {
        Ok((recommended_actions, snapshot)) => {
            let payload = WorkflowUpdatePayload {
                status: snapshot.gate_status,
                phase: snapshot.phase,
                recommended_actions,
                attempt: snapshot.attempts,
                max_attempts: snapshot.max_attempts,
            };
            match Envelope::new(EventType::WorkflowUpdate, &payload) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(error = %e, "Failed to encode workflow update");
                    None
                }
            }
        }
        Err(e) => Some(error_envelope(&e)),
    }
}

type PendingAttach = Pin<
    Box<dyn Future<Output = SessionResult<(SessionSnapshot, broadcast::Receiver<Envelope>)>> + Send>,
>;

async fn next_event(
    events: &mut Option<broadcast::Receiver<Envelope>>,
) -> Result<Envelope, RecvError> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn attach_done(
    resync: &mut Option<PendingAttach>,
) -> SessionResult<(SessionSnapshot, broadcast::Receiver<Envelope>)> {
    match resync {
        Some(attach) => attach.await,
        None => std::future::pending().await,
    }
}

/// Error category reported to the client.
pub fn error_kind(error: &SessionError) -> ErrorKind {
    match error {
        SessionError::NotFound { .. } => ErrorKind::SessionNotFound,
        SessionError::Closed { .. } => ErrorKind::SessionClosed,
        SessionError::Gate(GateError::Stalled { .. }) => ErrorKind::Stalled,
        SessionError::Gate(_) => ErrorKind::InvalidInput,
        SessionError::Pipeline(PipelineError::Scoring(_)) => ErrorKind::InvalidInput,
        SessionError::Pipeline(PipelineError::Validation(_)) => ErrorKind::InvalidInput,
        SessionError::Streaming(_) => ErrorKind::ProtocolError,
        SessionError::Storage(_) | SessionError::HistoryOrder { .. } => ErrorKind::Internal,
    }
}

fn error_envelope(error: &SessionError) -> Envelope {
    Envelope::error(error_kind(error), error.to_string())
}

async fn send_error<W: AsyncWrite + Unpin>(writer: &mut W, error: &SessionError) -> ChannelResult<()> {
    write_envelope(writer, &error_envelope(error)).await
}

async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> ChannelResult<()> {
    let line = envelope.to_line()?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GateConfig, SessionConfig};
    use crate::storage::SqliteStorage;
    use std::time::Duration;
    use tokio::io::{duplex, split};

    #[tokio::test]
    async fn test_lagged_connection_resyncs_without_stale_events() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let manager = Arc::new(SessionManager::new(
            Arc::new(storage),
            Vec::new(),
            &GateConfig {
                max_clarification_attempts: 3,
            },
            &SessionConfig { queue_capacity: 2 },
        ));
        let handle = manager.open(None).await.unwrap();
        let (_, events) = handle.attach().await.unwrap();
        let server = RealtimeServer::new(
            Arc::clone(&manager),
            RealtimeConfig {
                heartbeat_interval_secs: 30,
                reconnect_base_delay_ms: 10,
                reconnect_max_attempts: 3,
            },
        );

        // A pipe smaller than one envelope: the connection stalls on its
        // first write until the test starts reading.
        let (client, server_side) = duplex(64);
        let (server_read, mut server_write) = split(server_side);
        let (client_read, _client_write) = split(client);
        let pumped = handle.clone();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let (requests, _queue) = mpsc::channel(PENDING_REQUESTS);
            let (_replies, outbound) = mpsc::channel(PENDING_REQUESTS);
            server
                .pump(&mut lines, &mut server_write, &pumped, events, &requests, outbound)
                .await
        });

        for sequence in 1..=20u64 {
            handle.apply_chunk("m1", sequence, "x").await.unwrap();
        }

        let mut lines = BufReader::new(client_read).lines();
        let resync = loop {
            let line = timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let envelope: Envelope = serde_json::from_str(&line).unwrap();
            match envelope.event_type {
                EventType::ConnectionAck => break envelope,
                EventType::AiResponseChunk => continue,
                other => panic!("unexpected {}", other),
            }
        };

        let snapshot: SessionSnapshot = resync.payload_as().unwrap();
        let active = snapshot.active_message.unwrap();
        assert_eq!(active.sequence_last_applied, 20);
        assert_eq!(active.content_so_far.len(), 20);

        // Everything published before the resync is in the snapshot; nothing
        // older may follow it.
        assert!(timeout(Duration::from_millis(300), lines.next_line())
            .await
            .is_err());

        // Later events still flow on the new subscription.
        handle.apply_chunk("m1", 21, "y").await.unwrap();
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let envelope: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(envelope.event_type, EventType::AiResponseChunk);
        let chunk: crate::realtime::ChunkPayload = envelope.payload_as().unwrap();
        assert_eq!(chunk.sequence, 21);

        task.abort();
    }

    #[test]
    fn test_error_kind_mapping() {
        let stalled = SessionError::Gate(GateError::Stalled {
            phase: "requirements".to_string(),
            attempts: 10,
            reason: "below baseline".to_string(),
        });
        assert_eq!(error_kind(&stalled), ErrorKind::Stalled);
        assert_eq!(
            error_kind(&SessionError::Gate(GateError::AlreadyCompleted)),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            error_kind(&SessionError::Closed {
                session_id: "s".to_string()
            }),
            ErrorKind::SessionClosed
        );
        assert_eq!(
            error_kind(&SessionError::NotFound {
                session_id: "s".to_string()
            }),
            ErrorKind::SessionNotFound
        );
    }
}
