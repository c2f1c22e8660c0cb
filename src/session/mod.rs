//! Session execution context.
//!
//! Each consultation session is owned by one worker task fed through a
//! bounded command queue. Handles are cheap clones of the queue sender; the
//! [`SessionManager`] is the registry of live sessions and the entry point
//! for opening, resuming and closing them.

mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tracing::{info, warn};

use crate::config::{GateConfig, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::gate::{ConsultationGate, GateDecision, GateStatus};
use crate::history::{ConfidenceHistoryPoint, HistoryTracker, Trend, WorkflowPhase};
use crate::realtime::Envelope;
use crate::scoring::{ConfidenceScore, ScoringInput, ScoringPipeline};
use crate::storage::{SessionRecord, Storage};
use crate::streaming::{ChunkOutcome, StreamingMessage};
use crate::validation::KnowledgeSource;

use worker::{SessionCommand, SessionWorker, WorkerContext};

/// Full session state, sent on every (re)connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub phase: WorkflowPhase,
    pub gate_status: GateStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ConfidenceScore>,
    #[serde(default)]
    pub pending_actions: Vec<String>,
    #[serde(default)]
    pub history: Vec<ConfidenceHistoryPoint>,
    pub trend: Trend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_message: Option<StreamingMessage>,
    #[serde(default)]
    pub finalized_messages: Vec<StreamingMessage>,
}

/// Result of submitting new input.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// The recomputed score.
    pub score: ConfidenceScore,
    /// Transition retried automatically while awaiting clarification.
    pub decision: Option<GateDecision>,
}

/// Cloneable handle to a running session worker.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Arc<str>,
    commands: mpsc::Sender<SessionCommand>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once the worker has stopped or a close was requested.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed() || *self.shutdown.borrow()
    }

    /// Score new factor estimates. While the gate awaits clarification this
    /// also retries the blocked transition.
    pub async fn submit_input(&self, input: ScoringInput) -> SessionResult<SubmitOutcome> {
        self.request(|reply| SessionCommand::SubmitInput {
            input: Box::new(input),
            reply,
        })
        .await?
    }

    /// Attempt the next phase transition.
    pub async fn advance(&self) -> SessionResult<GateDecision> {
        self.request(|reply| SessionCommand::Advance { reply }).await?
    }

    /// Whether the current score would let the workflow advance.
    pub async fn can_advance(&self) -> SessionResult<bool> {
        self.request(|reply| SessionCommand::CanAdvance { reply })
            .await
    }

    /// Recommended actions for the current score.
    pub async fn request_clarification(&self) -> SessionResult<Vec<String>> {
        self.request(|reply| SessionCommand::RequestClarification { reply })
            .await?
    }

    /// Feed one streamed response chunk.
    pub async fn apply_chunk(
        &self,
        message_id: impl Into<String>,
        sequence: u64,
        content: impl Into<String>,
    ) -> SessionResult<ChunkOutcome> {
        let message_id = message_id.into();
        let content = content.into();
        self.request(|reply| SessionCommand::Chunk {
            message_id,
            sequence,
            content,
            reply,
        })
        .await?
    }

    /// Mark a streamed message complete.
    pub async fn complete_message(
        &self,
        message_id: impl Into<String>,
    ) -> SessionResult<Option<StreamingMessage>> {
        let message_id = message_id.into();
        self.request(|reply| SessionCommand::Complete { message_id, reply })
            .await?
    }

    /// Snapshot plus a subscription that starts right after it.
    pub async fn attach(&self) -> SessionResult<(SessionSnapshot, broadcast::Receiver<Envelope>)> {
        self.request(|reply| SessionCommand::Attach { reply }).await
    }

    /// Current full state.
    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }

    /// Stop the worker. In-flight and queued requests fail as closed.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> SessionResult<T> {
        if *self.shutdown.borrow() {
            return Err(self.closed());
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| self.closed())?;
        response.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> SessionError {
        SessionError::Closed {
            session_id: self.session_id.to_string(),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry of live sessions.
pub struct SessionManager {
    storage: Arc<dyn Storage>,
    sources: Arc<Vec<Arc<dyn KnowledgeSource>>>,
    pipeline: ScoringPipeline,
    max_attempts: u32,
    queue_capacity: usize,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    /// Create a manager over a storage backend and a set of validation sources.
    pub fn new(
        storage: Arc<dyn Storage>,
        sources: Vec<Arc<dyn KnowledgeSource>>,
        gate: &GateConfig,
        session: &SessionConfig,
    ) -> Self {
        Self {
            storage,
            sources: Arc::new(sources),
            pipeline: ScoringPipeline::new(),
            max_attempts: gate.max_clarification_attempts,
            queue_capacity: session.queue_capacity.max(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a new session, or resume `session_id` (live or persisted).
    pub async fn open(&self, session_id: Option<&str>) -> SessionResult<SessionHandle> {
        let mut sessions = self.sessions.write().await;

        let Some(id) = session_id else {
            let record = SessionRecord::new();
            self.storage.create_session(&record).await?;
            info!(session_id = %record.id, "Session created");
            let handle = self.spawn(record, HistoryTracker::new());
            sessions.insert(handle.session_id().to_string(), handle.clone());
            return Ok(handle);
        };

        if let Some(handle) = sessions.get(id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let record = self
            .storage
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound {
                session_id: id.to_string(),
            })?;
        let history = HistoryTracker::from_points(self.storage.get_history(id).await?)?;
        info!(
            session_id = %id,
            phase = %record.phase,
            status = %record.status,
            points = history.len(),
            has_score = record.last_score.is_some(),
            "Session resumed"
        );

        let handle = self.spawn(record, history);
        sessions.insert(id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Live session by id.
    pub async fn get(&self, session_id: &str) -> SessionResult<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .filter(|h| !h.is_closed())
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Whether the session may advance right now.
    pub async fn can_advance(&self, session_id: &str) -> SessionResult<bool> {
        self.get(session_id).await?.can_advance().await
    }

    /// Recommended actions for the session's current score.
    pub async fn request_clarification(&self, session_id: &str) -> SessionResult<Vec<String>> {
        self.get(session_id).await?.request_clarification().await
    }

    /// Stop a live session. Its persisted state is kept.
    pub async fn close(&self, session_id: &str) -> SessionResult<()> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        handle.close();
        info!(session_id = %session_id, "Session closed");
        Ok(())
    }

    /// Tear a session down: stop it and delete its record and history.
    pub async fn delete(&self, session_id: &str) -> SessionResult<()> {
        if let Some(handle) = self.sessions.write().await.remove(session_id) {
            handle.close();
        }
        self.storage.delete_session(session_id).await?;
        info!(session_id = %session_id, "Session deleted");
        Ok(())
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every live session.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (id, handle) in sessions.drain() {
            handle.close();
            info!(session_id = %id, "Session closed on shutdown");
        }
    }

    fn spawn(&self, record: SessionRecord, history: HistoryTracker) -> SessionHandle {
        let session_id: Arc<str> = Arc::from(record.id.as_str());
        let gate = ConsultationGate::restore(record.phase, record.status, self.max_attempts);
        if gate.status().is_terminal() {
            warn!(session_id = %record.id, status = %gate.status(), "Opening a terminal session");
        }

        let (commands, queue) = mpsc::channel(self.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(self.queue_capacity);

        let context = WorkerContext {
            record,
            history,
            gate,
            pipeline: self.pipeline.clone(),
            sources: Arc::clone(&self.sources),
            storage: Arc::clone(&self.storage),
            events,
        };
        tokio::spawn(SessionWorker::new(context, queue, shutdown_rx).run());

        SessionHandle {
            session_id,
            commands,
            shutdown: Arc::new(shutdown),
        }
    }
}
