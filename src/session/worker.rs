use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{SessionSnapshot, SubmitOutcome};
use crate::error::{GateError, PipelineError, SessionError, SessionResult};
use crate::gate::{ConsultationGate, GateDecision};
use crate::history::{HistoryTracker, WorkflowPhase};
use crate::realtime::{
    ChunkPayload, CompletePayload, Envelope, EventType, PhaseChangePayload,
    ProgressPayload, WorkflowUpdatePayload,
};
use crate::scoring::{ConfidenceScore, ScoringInput, ScoringPipeline};
use crate::storage::{SessionRecord, Storage};
use crate::streaming::{ChunkOutcome, StreamingMessage, StreamingResponseAssembler};
use crate::validation::{KnowledgeSource, MultiSourceValidator, SourceRequest};

/// Work queued for a session worker.
pub(crate) enum SessionCommand {
    SubmitInput {
        input: Box<ScoringInput>,
        reply: oneshot::Sender<SessionResult<SubmitOutcome>>,
    },
    Advance {
        reply: oneshot::Sender<SessionResult<GateDecision>>,
    },
    CanAdvance {
        reply: oneshot::Sender<bool>,
    },
    RequestClarification {
        reply: oneshot::Sender<SessionResult<Vec<String>>>,
    },
    Chunk {
        message_id: String,
        sequence: u64,
        content: String,
        reply: oneshot::Sender<SessionResult<ChunkOutcome>>,
    },
    Complete {
        message_id: String,
        reply: oneshot::Sender<SessionResult<Option<StreamingMessage>>>,
    },
    Attach {
        reply: oneshot::Sender<(SessionSnapshot, broadcast::Receiver<Envelope>)>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Everything a worker needs besides its queue.
pub(crate) struct WorkerContext {
    pub record: SessionRecord,
    pub history: HistoryTracker,
    pub gate: ConsultationGate,
    pub pipeline: ScoringPipeline,
    pub sources: Arc<Vec<Arc<dyn KnowledgeSource>>>,
    pub storage: Arc<dyn Storage>,
    pub events: broadcast::Sender<Envelope>,
}

/// Single writer of one session. Owns the whole session context; every
/// mutation happens on this task, in queue order.
pub(crate) struct SessionWorker {
    /// Also carries the current score.
    record: SessionRecord,
    history: HistoryTracker,
    assembler: StreamingResponseAssembler,
    gate: ConsultationGate,
    pipeline: ScoringPipeline,
    validator: MultiSourceValidator,
    sources: Arc<Vec<Arc<dyn KnowledgeSource>>>,
    storage: Arc<dyn Storage>,
    events: broadcast::Sender<Envelope>,
    commands: mpsc::Receiver<SessionCommand>,
    shutdown: watch::Receiver<bool>,
}

impl SessionWorker {
    pub(crate) fn new(
        context: WorkerContext,
        commands: mpsc::Receiver<SessionCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            record: context.record,
            history: context.history,
            assembler: StreamingResponseAssembler::new(),
            gate: context.gate,
            pipeline: context.pipeline,
            validator: MultiSourceValidator::new(),
            sources: context.sources,
            storage: context.storage,
            events: context.events,
            commands,
            shutdown,
        }
    }

    /// Process commands until the session is closed or every handle is gone.
    pub(crate) async fn run(mut self) {
        info!(session_id = %self.record.id, phase = %self.gate.phase(), "Session worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let command = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            self.handle(command).await;
        }

        // Queued commands are dropped with their reply senders, which their
        // callers observe as a closed session.
        self.commands.close();
        info!(session_id = %self.record.id, "Session worker stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SubmitInput { input, reply } => {
                let result = self.submit_input(*input).await;
                let _ = reply.send(result);
            }
            SessionCommand::Advance { reply } => {
                let result = self.advance().await;
                let _ = reply.send(result);
            }
            SessionCommand::CanAdvance { reply } => {
                let _ = reply.send(self.gate.can_advance(self.score()));
            }
            SessionCommand::RequestClarification { reply } => {
                let result = self
                    .gate
                    .request_clarification(self.record.last_score.as_ref())
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            SessionCommand::Chunk {
                message_id,
                sequence,
                content,
                reply,
            } => {
                let result = self.apply_chunk(message_id, sequence, content);
                let _ = reply.send(result);
            }
            SessionCommand::Complete { message_id, reply } => {
                let result = self.complete_message(&message_id);
                let _ = reply.send(result);
            }
            SessionCommand::Attach { reply } => {
                // Subscribe before snapshotting: nothing can slip in between
                // because this task is the only publisher.
                let receiver = self.events.subscribe();
                let _ = reply.send((self.snapshot(), receiver));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn submit_input(&mut self, input: ScoringInput) -> SessionResult<SubmitOutcome> {
        self.gate.ensure_open()?;
        input
            .factors
            .validate()
            .map_err(|e| SessionError::Pipeline(PipelineError::Scoring(e)))?;

        let extra = if self.sources.is_empty() {
            Vec::new()
        } else {
            let request = SourceRequest::new(self.record.id.clone(), input.factors);
            let gathered = tokio::select! {
                gathered = self.validator.gather(&self.sources, &request) => gathered,
                _ = self.shutdown.changed() => {
                    return Err(SessionError::Closed {
                        session_id: self.record.id.clone(),
                    });
                }
            };
            // Scores supplied with the input win over live lookups.
            gathered
                .into_iter()
                .filter(|s| !input.sources.iter().any(|own| own.kind == s.kind))
                .collect()
        };

        let outcome = self.pipeline.evaluate(&input, &extra)?;
        let score = outcome.score;

        self.record_point(score.overall_confidence(), self.gate.phase()).await?;
        self.persist_record(Some(score.clone())).await?;

        info!(
            session_id = %self.record.id,
            phase = %self.gate.phase(),
            confidence = score.overall_confidence(),
            meets_baseline = score.meets_baseline(),
            trend = %self.history.trend(),
            "Confidence updated"
        );
        self.publish(EventType::ConfidenceUpdate, &score);

        let decision = if self.gate.awaiting_clarification() {
            Some(self.advance().await?)
        } else {
            None
        };

        Ok(SubmitOutcome { score, decision })
    }

    async fn advance(&mut self) -> SessionResult<GateDecision> {
        let result = self.gate.attempt_transition(self.record.last_score.as_ref());
        let last_score = self.record.last_score.clone();

        match &result {
            Ok(GateDecision::Advanced { from, to }) => {
                if let Some(score) = &last_score {
                    self.record_point(score.overall_confidence(), *to).await?;
                }
                self.persist_record(last_score).await?;
                self.publish(
                    EventType::PhaseChange,
                    &PhaseChangePayload {
                        from: *from,
                        to: *to,
                    },
                );
                self.publish(EventType::ProgressUpdate, &ProgressPayload::for_phase(*to));
                self.publish_workflow();
            }
            Ok(GateDecision::Blocked { .. }) => {
                self.persist_record(last_score).await?;
                self.publish_workflow();
            }
            Err(GateError::Stalled { .. }) => {
                self.persist_record(last_score).await?;
                self.publish_workflow();
            }
            Err(_) => {}
        }

        result.map_err(SessionError::from)
    }

    fn apply_chunk(
        &mut self,
        message_id: String,
        sequence: u64,
        content: String,
    ) -> SessionResult<ChunkOutcome> {
        let outcome = self.assembler.apply_chunk(&message_id, sequence, &content)?;
        if outcome.is_applied() {
            self.publish(
                EventType::AiResponseChunk,
                &ChunkPayload {
                    message_id,
                    sequence,
                    content,
                },
            );
        }
        Ok(outcome)
    }

    fn complete_message(&mut self, message_id: &str) -> SessionResult<Option<StreamingMessage>> {
        let finalized = self.assembler.complete(message_id)?;
        if finalized.is_some() {
            self.publish(
                EventType::AiResponseComplete,
                &CompletePayload {
                    message_id: message_id.to_string(),
                },
            );
        }
        Ok(finalized)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.record.id.clone(),
            phase: self.gate.phase(),
            gate_status: self.gate.status(),
            attempts: self.gate.attempts(),
            max_attempts: self.gate.max_attempts(),
            score: self.record.last_score.clone(),
            pending_actions: self.gate.pending_actions().to_vec(),
            history: self.history.points().to_vec(),
            trend: self.history.trend(),
            active_message: self.assembler.active().cloned(),
            finalized_messages: self.assembler.finalized().to_vec(),
        }
    }

    fn score(&self) -> Option<&ConfidenceScore> {
        self.record.last_score.as_ref()
    }

    /// Store a history point, then append it. A failed write leaves the
    /// live history untouched.
    async fn record_point(&mut self, confidence: f64, phase: WorkflowPhase) -> SessionResult<()> {
        let point = self.history.next_point(confidence, phase);
        self.storage
            .append_history_point(&self.record.id, &point)
            .await
            .map_err(|e| {
                error!(session_id = %self.record.id, error = %e, "Failed to persist history point");
                SessionError::from(e)
            })?;
        self.history.push(point)
    }

    /// Store phase, status and score. The live record only changes once the
    /// write went through.
    async fn persist_record(&mut self, last_score: Option<ConfidenceScore>) -> SessionResult<()> {
        let mut record = self.record.clone();
        record.touch(self.gate.phase(), self.gate.status());
        record.last_score = last_score;
        self.storage.update_session(&record).await.map_err(|e| {
            error!(session_id = %self.record.id, error = %e, "Failed to persist session");
            SessionError::from(e)
        })?;
        self.record = record;
        Ok(())
    }

    fn publish_workflow(&self) {
        let payload = WorkflowUpdatePayload {
            status: self.gate.status(),
            phase: self.gate.phase(),
            recommended_actions: self.gate.pending_actions().to_vec(),
            attempt: self.gate.attempts(),
            max_attempts: self.gate.max_attempts(),
        };
        self.publish(EventType::WorkflowUpdate, &payload);
    }

    fn publish<T: Serialize>(&self, event_type: EventType, payload: &T) {
        match Envelope::new(event_type, payload) {
            Ok(envelope) => self.send(envelope),
            Err(e) => warn!(event = %event_type, error = %e, "Failed to encode event"),
        }
    }

    fn send(&self, envelope: Envelope) {
        // No subscribers is not an error: the snapshot covers late joiners.
        if self.events.send(envelope).is_err() {
            debug!(session_id = %self.record.id, "No subscribers attached");
        }
    }
}
