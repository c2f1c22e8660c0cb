//! Wire format of the realtime channel.
//!
//! Every line on the socket is one JSON object. Server to client:
//! `{ "type": ..., "payload": ..., "timestamp": ... }`. Client to server:
//! `{ "type": ..., "payload": ... }` with the payload omitted for messages
//! that carry none.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};
use crate::gate::GateStatus;
use crate::history::WorkflowPhase;
use crate::scoring::ScoringInput;

/// Outbound event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Heartbeat,
    ConfidenceUpdate,
    AiResponseChunk,
    AiResponseComplete,
    WorkflowUpdate,
    PhaseChange,
    ProgressUpdate,
    Error,
    ConnectionAck,
}

impl EventType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Heartbeat => "heartbeat",
            EventType::ConfidenceUpdate => "confidence_update",
            EventType::AiResponseChunk => "ai_response_chunk",
            EventType::AiResponseComplete => "ai_response_complete",
            EventType::WorkflowUpdate => "workflow_update",
            EventType::PhaseChange => "phase_change",
            EventType::ProgressUpdate => "progress_update",
            EventType::Error => "error",
            EventType::ConnectionAck => "connection_ack",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a payload, stamped now.
    pub fn new<T: Serialize>(event_type: EventType, payload: &T) -> ChannelResult<Self> {
        Ok(Self {
            event_type,
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
        })
    }

    /// Heartbeat with an empty payload.
    pub fn heartbeat() -> Self {
        Self {
            event_type: EventType::Heartbeat,
            payload: Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// Error envelope.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            kind,
            message: message.into(),
        };
        Self {
            event_type: EventType::Error,
            payload: serde_json::to_value(&payload).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> ChannelResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// One line, newline included.
    pub fn to_line(&self) -> ChannelResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// `ai_response_chunk` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub message_id: String,
    pub sequence: u64,
    pub content: String,
}

/// `ai_response_complete` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub message_id: String,
}

/// `phase_change` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChangePayload {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
}

/// `workflow_update` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowUpdatePayload {
    pub status: GateStatus,
    pub phase: WorkflowPhase,
    pub recommended_actions: Vec<String>,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// `progress_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub phase: WorkflowPhase,
    pub phase_index: usize,
    pub total_phases: usize,
    pub percent: f64,
}

impl ProgressPayload {
    /// Progress through the workflow at `phase`.
    pub fn for_phase(phase: WorkflowPhase) -> Self {
        let total_phases = WorkflowPhase::ALL.len();
        let phase_index = phase.index();
        Self {
            phase,
            phase_index,
            total_phases,
            percent: phase_index as f64 / (total_phases - 1) as f64 * 100.0,
        }
    }
}

/// Category of an `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedMessage,
    HandshakeRequired,
    InvalidInput,
    ProtocolError,
    Stalled,
    SessionNotFound,
    SessionClosed,
    Internal,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

/// `hello` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello(HelloPayload),
    Heartbeat,
    SubmitInput(ScoringInput),
    Advance,
    RequestClarification,
    Close,
}

impl ClientMessage {
    /// Parse one inbound line.
    pub fn parse(line: &str) -> ChannelResult<Self> {
        serde_json::from_str(line).map_err(|e| ChannelError::Malformed {
            message: e.to_string(),
        })
    }

    /// One line, newline included.
    pub fn to_line(&self) -> ChannelResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
