use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::SourceKind;
use crate::error::{ValidationError, ValidationResult};
use crate::scoring::ConfidenceFactors;

/// Payload sent to a validation source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRequest {
    pub session_id: String,
    pub factors: ConfidenceFactors,
}

impl SourceRequest {
    /// Create a request for one session.
    pub fn new(session_id: impl Into<String>, factors: ConfidenceFactors) -> Self {
        Self {
            session_id: session_id.into(),
            factors,
        }
    }
}

/// An independent scorer of the consultation state.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Which category this source belongs to.
    fn kind(&self) -> SourceKind;

    /// Score the request in [0, 1].
    async fn score(&self, request: &SourceRequest) -> ValidationResult<f64>;
}

/// A source with a fixed answer. Used for offline scoring and tests.
#[derive(Debug, Clone)]
pub struct StaticSource {
    kind: SourceKind,
    score: Option<f64>,
}

impl StaticSource {
    /// Source that always answers `score`.
    pub fn new(kind: SourceKind, score: f64) -> Self {
        Self {
            kind,
            score: Some(score),
        }
    }

    /// Source that is always unavailable.
    pub fn unavailable(kind: SourceKind) -> Self {
        Self { kind, score: None }
    }
}

#[async_trait]
impl KnowledgeSource for StaticSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn score(&self, _request: &SourceRequest) -> ValidationResult<f64> {
        self.score.ok_or_else(|| ValidationError::Unavailable {
            source_name: self.kind.to_string(),
            message: "source offline".to_string(),
            retries: 0,
        })
    }
}
