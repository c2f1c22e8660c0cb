use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionState, ReconnectPolicy};
use super::envelope::{ClientMessage, Envelope, EventType, HelloPayload};
use crate::error::{ChannelError, ChannelResult};
use crate::session::SessionSnapshot;

/// Client side of the realtime channel with automatic reconnection.
///
/// The same session is resumed on every reconnect; each successful handshake
/// yields a fresh snapshot that replaces whatever the caller held before.
pub struct RealtimeClient {
    addr: String,
    connection: Connection,
    session_id: Option<String>,
}

impl RealtimeClient {
    pub fn new(addr: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            addr: addr.into(),
            connection: Connection::new(policy),
            session_id: None,
        }
    }

    /// Resume `session_id` instead of opening a new session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Connect, retrying with backoff until the attempt cap.
    ///
    /// After the cap the connection is in `error` and this fails with
    /// [`ChannelError::ReconnectExhausted`] until
    /// [`manual_reconnect`](Self::manual_reconnect) is called. The returned
    /// session borrows the client; dropping it or losing the link moves the
    /// connection to `disconnected` so the next call resumes.
    pub async fn connect(&mut self) -> ChannelResult<ClientSession<'_>> {
        loop {
            match self.connection.state() {
                ConnectionState::Connecting => match self.connect_once().await {
                    Ok((link, snapshot)) => {
                        self.connection
                            .on_connected(snapshot.session_id.clone(), Instant::now())?;
                        self.session_id = Some(snapshot.session_id.clone());
                        return Ok(ClientSession {
                            client: self,
                            lines: link.lines,
                            writer: link.writer,
                            snapshot,
                        });
                    }
                    Err(e) => {
                        warn!(
                            addr = %self.addr,
                            attempt = self.connection.reconnect_attempts() + 1,
                            error = %e,
                            "Connection attempt failed"
                        );
                        if self.connection.on_connect_failed()? == ConnectionState::Error {
                            return Err(ChannelError::ReconnectExhausted {
                                attempts: self.connection.reconnect_attempts(),
                            });
                        }
                    }
                },
                ConnectionState::Disconnected => {
                    let delay = self.connection.begin_reconnect()?;
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
                ConnectionState::Error => {
                    return Err(ChannelError::ReconnectExhausted {
                        attempts: self.connection.reconnect_attempts(),
                    });
                }
                ConnectionState::Connected => {
                    return Err(ChannelError::InvalidTransition {
                        from: ConnectionState::Connected.to_string(),
                        to: ConnectionState::Connecting.to_string(),
                    });
                }
            }
        }
    }

    /// Leave `error` after the attempt cap was hit.
    pub fn manual_reconnect(&mut self) -> ChannelResult<()> {
        self.connection.manual_reconnect()
    }

    async fn connect_once(&self) -> ChannelResult<(Link, SessionSnapshot)> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let hello = ClientMessage::Hello(HelloPayload {
            session_id: self.session_id.clone(),
        });
        writer.write_all(hello.to_line()?.as_bytes()).await?;
        writer.flush().await?;

        let line = lines.next_line().await?.ok_or_else(|| ChannelError::Handshake {
            message: "connection closed during handshake".to_string(),
        })?;
        let envelope: Envelope = serde_json::from_str(&line)?;

        match envelope.event_type {
            EventType::ConnectionAck => {
                let snapshot: SessionSnapshot = envelope.payload_as()?;
                info!(addr = %self.addr, session_id = %snapshot.session_id, "Handshake acknowledged");
                Ok((Link { lines, writer }, snapshot))
            }
            other => Err(ChannelError::Handshake {
                message: format!("expected connection_ack, got {} ({})", other, envelope.payload),
            }),
        }
    }
}

struct Link {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// One established connection.
///
/// Every inbound frame refreshes the owning client's liveness; EOF, I/O
/// errors and silence past the dead-connection threshold move it to
/// `disconnected`.
pub struct ClientSession<'a> {
    client: &'a mut RealtimeClient,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    snapshot: SessionSnapshot,
}

impl ClientSession<'_> {
    /// Latest authoritative snapshot.
    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn connection(&self) -> &Connection {
        &self.client.connection
    }

    /// Send one message.
    pub async fn send(&mut self, message: &ClientMessage) -> ChannelResult<()> {
        let line = message.to_line()?;
        if let Err(e) = self.write_line(&line).await {
            self.lost();
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn heartbeat(&mut self) -> ChannelResult<()> {
        self.send(&ClientMessage::Heartbeat).await
    }

    /// Next envelope, `None` when the server closed the connection.
    ///
    /// Server heartbeats are answered. A later `connection_ack` (resync
    /// after lag) replaces the stored snapshot.
    pub async fn next_event(&mut self) -> ChannelResult<Option<Envelope>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.lost();
                    return Ok(None);
                }
                Err(e) => {
                    self.lost();
                    return Err(e.into());
                }
            };
            self.client.connection.on_traffic(Instant::now());
            if line.trim().is_empty() {
                continue;
            }

            let envelope: Envelope = serde_json::from_str(&line)?;
            match envelope.event_type {
                EventType::ConnectionAck => self.snapshot = envelope.payload_as()?,
                EventType::Heartbeat => self.heartbeat().await?,
                _ => {}
            }
            debug!(event = %envelope.event_type, "Event received");
            return Ok(Some(envelope));
        }
    }

    /// Like [`next_event`](Self::next_event) but treats no inbound traffic
    /// for longer than `dead_after` as a dead connection.
    pub async fn next_event_within(&mut self, dead_after: Duration) -> ChannelResult<Option<Envelope>> {
        let last = self
            .client
            .connection
            .last_heartbeat_at()
            .unwrap_or_else(Instant::now);

        match timeout_at(last + dead_after, self.next_event()).await {
            Ok(event) => event,
            Err(_) => {
                let now = Instant::now();
                let idle = now.saturating_duration_since(last);
                if self.client.connection.is_stale(now, dead_after) {
                    warn!(idle_secs = idle.as_secs(), "No traffic from server, connection is dead");
                    self.lost();
                }
                Err(ChannelError::DeadConnection {
                    idle_secs: idle.as_secs(),
                })
            }
        }
    }

    /// Wait for the first event of `event_type`, skipping others.
    pub async fn wait_for(&mut self, event_type: EventType) -> ChannelResult<Envelope> {
        loop {
            match self.next_event().await? {
                Some(envelope) if envelope.event_type == event_type => return Ok(envelope),
                Some(_) => continue,
                None => {
                    return Err(ChannelError::Handshake {
                        message: format!("connection closed while waiting for {}", event_type),
                    })
                }
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    fn lost(&mut self) {
        if self.client.connection.state() == ConnectionState::Connected {
            let _ = self.client.connection.on_disconnected();
        }
    }
}

impl Drop for ClientSession<'_> {
    fn drop(&mut self) {
        self.lost();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn ack_line(session_id: &str) -> String {
        let snapshot = serde_json::json!({
            "sessionId": session_id,
            "phase": "requirements",
            "gateStatus": "active",
            "attempts": 0,
            "maxAttempts": 3,
            "trend": "stable",
        });
        Envelope::new(EventType::ConnectionAck, &snapshot)
            .unwrap()
            .to_line()
            .unwrap()
    }

    /// Accept one connection, ack its `hello` and hand back the session id
    /// the client asked for.
    async fn accept_hello(listener: &TcpListener, session_id: &str) -> (Option<String>, TcpStream) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let requested = match ClientMessage::parse(line.trim()).unwrap() {
            ClientMessage::Hello(hello) => hello.session_id,
            other => panic!("expected hello, got {:?}", other),
        };
        let mut stream = stream.into_inner();
        stream.write_all(ack_line(session_id).as_bytes()).await.unwrap();
        (requested, stream)
    }

    #[tokio::test]
    async fn test_traffic_keeps_connection_alive_and_silence_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let policy = ReconnectPolicy::new(Duration::from_millis(1), 3);
        let mut client = RealtimeClient::new(addr.to_string(), policy);

        let (accepted, connected) = tokio::join!(accept_hello(&listener, "s-1"), client.connect());
        let (requested, mut server) = accepted;
        assert_eq!(requested, None);
        let mut session = connected.unwrap();
        assert_eq!(session.connection().state(), ConnectionState::Connected);
        let connected_at = session.connection().last_heartbeat_at().unwrap();

        sleep(Duration::from_millis(20)).await;
        server
            .write_all(Envelope::heartbeat().to_line().unwrap().as_bytes())
            .await
            .unwrap();
        let envelope = session
            .next_event_within(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.event_type, EventType::Heartbeat);
        assert!(session.connection().last_heartbeat_at().unwrap() > connected_at);

        // The server heartbeat is answered.
        let mut reply = String::new();
        BufReader::new(&mut server).read_line(&mut reply).await.unwrap();
        assert_eq!(ClientMessage::parse(reply.trim()).unwrap(), ClientMessage::Heartbeat);

        // Then the server goes quiet.
        assert!(matches!(
            session.next_event_within(Duration::from_millis(100)).await,
            Err(ChannelError::DeadConnection { .. })
        ));
        assert_eq!(session.connection().state(), ConnectionState::Disconnected);
        drop(session);
        drop(server);

        // The next connect resumes the same session.
        let (accepted, reconnected) =
            tokio::join!(accept_hello(&listener, "s-1"), client.connect());
        assert_eq!(accepted.0.as_deref(), Some("s-1"));
        let session = reconnected.unwrap();
        assert_eq!(session.connection().state(), ConnectionState::Connected);
        assert_eq!(session.snapshot().session_id, "s-1");
    }

    #[tokio::test]
    async fn test_server_hangup_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client =
            RealtimeClient::new(addr.to_string(), ReconnectPolicy::new(Duration::from_millis(1), 3));

        let (accepted, connected) = tokio::join!(accept_hello(&listener, "s-2"), client.connect());
        let mut session = connected.unwrap();
        drop(accepted);

        assert!(session.next_event().await.unwrap().is_none());
        assert_eq!(session.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_exhausts_attempts_against_closed_port() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let policy = ReconnectPolicy::new(Duration::from_millis(1), 3);
        let mut client = RealtimeClient::new(addr.to_string(), policy);

        let err = client.connect().await.err().unwrap();
        assert!(matches!(err, ChannelError::ReconnectExhausted { attempts: 3 }));
        assert_eq!(client.connection().state(), ConnectionState::Error);

        // Stays in error until a manual reconnect.
        assert!(matches!(
            client.connect().await.err().unwrap(),
            ChannelError::ReconnectExhausted { .. }
        ));
        client.manual_reconnect().unwrap();
        assert_eq!(client.connection().state(), ConnectionState::Connecting);
    }
}
