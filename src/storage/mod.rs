//! Storage layer for consultation sessions.
//!
//! Persists the minimal records the engine reads back on resume: the session
//! row (phase, gate status and last score) and its confidence history.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::gate::GateStatus;
use crate::history::{ConfidenceHistoryPoint, WorkflowPhase};
use crate::scoring::ConfidenceScore;

/// Persisted consultation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Unique session identifier.
    pub id: String,
    /// Current workflow phase.
    pub phase: WorkflowPhase,
    /// Gate status.
    pub status: GateStatus,
    /// Most recent score, restored into the snapshot on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_score: Option<ConfidenceScore>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// New session at the requirements phase with a random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// New session with a caller-chosen id.
    pub fn with_id(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            phase: WorkflowPhase::Requirements,
            status: GateStatus::Active,
            last_score: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a phase/status change.
    pub fn touch(&mut self, phase: WorkflowPhase, status: GateStatus) {
        self.phase = phase;
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistence backend used by the session workers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create a new session.
    async fn create_session(&self, session: &SessionRecord) -> StorageResult<()>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>>;
    /// Update an existing session.
    async fn update_session(&self, session: &SessionRecord) -> StorageResult<()>;
    /// Delete a session together with its history.
    async fn delete_session(&self, id: &str) -> StorageResult<()>;

    /// Append one history point.
    async fn append_history_point(
        &self,
        session_id: &str,
        point: &ConfidenceHistoryPoint,
    ) -> StorageResult<()>;
    /// History of a session, oldest first.
    async fn get_history(&self, session_id: &str) -> StorageResult<Vec<ConfidenceHistoryPoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_record_defaults() {
        let record = SessionRecord::new();
        assert_eq!(record.phase, WorkflowPhase::Requirements);
        assert_eq!(record.status, GateStatus::Active);
        assert_eq!(record.created_at, record.updated_at);
        assert!(Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn test_touch_updates_state() {
        let mut record = SessionRecord::with_id("s-1");
        record.touch(WorkflowPhase::Testing, GateStatus::AwaitingClarification);
        assert_eq!(record.id, "s-1");
        assert_eq!(record.phase, WorkflowPhase::Testing);
        assert_eq!(record.status, GateStatus::AwaitingClarification);
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn test_session_record_serializes_camel_case() {
        let record = SessionRecord::with_id("s-2");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["phase"], "requirements");
        assert_eq!(json["status"], "active");
        assert!(json.get("createdAt").is_some());
    }
}
