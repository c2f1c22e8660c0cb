use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::factors::ConfidenceFactors;
use crate::error::{ScoringError, ScoringResult};

/// Overall confidence required before the workflow may advance.
pub const BASELINE: f64 = 0.95;

/// True iff `overall` reaches the baseline.
pub fn meets_baseline(overall: f64) -> bool {
    overall >= BASELINE
}

/// A computed confidence score.
///
/// Produced once by [`ConfidenceScore::new`] and never mutated; a
/// recomputation yields a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceScore {
    overall_confidence: f64,
    factors: ConfidenceFactors,
    confidence_boosters: Vec<String>,
    uncertainty_factors: Vec<String>,
    recommended_actions: Vec<String>,
    meets_baseline: bool,
    timestamp: DateTime<Utc>,
}

impl ConfidenceScore {
    /// Build a score, checking its consistency.
    ///
    /// A positive penalty without any uncertainty strings, or an imperfect
    /// score with an empty uncertainty list, is a caller bug and fails the
    /// computation.
    pub fn new(
        overall_confidence: f64,
        factors: ConfidenceFactors,
        confidence_boosters: Vec<String>,
        uncertainty_factors: Vec<String>,
        recommended_actions: Vec<String>,
        penalty: f64,
        timestamp: DateTime<Utc>,
    ) -> ScoringResult<Self> {
        if !(0.0..=1.0).contains(&overall_confidence) {
            return Err(ScoringError::OutOfRange {
                factor: "overall_confidence".to_string(),
                value: overall_confidence,
            });
        }

        if uncertainty_factors.is_empty() && (penalty > 0.0 || overall_confidence < 1.0) {
            let message = format!(
                "score {:.4} (penalty {:.2}) produced no uncertainty factors",
                overall_confidence, penalty
            );
            error!(
                overall_confidence,
                penalty,
                boosters = confidence_boosters.len(),
                actions = recommended_actions.len(),
                "Fatal confidence consistency error"
            );
            return Err(ScoringError::ConsistencyViolation { message });
        }

        Ok(Self {
            overall_confidence,
            factors,
            confidence_boosters,
            uncertainty_factors,
            recommended_actions,
            meets_baseline: meets_baseline(overall_confidence),
            timestamp,
        })
    }

    pub fn overall_confidence(&self) -> f64 {
        self.overall_confidence
    }

    pub fn factors(&self) -> &ConfidenceFactors {
        &self.factors
    }

    pub fn confidence_boosters(&self) -> &[String] {
        &self.confidence_boosters
    }

    pub fn uncertainty_factors(&self) -> &[String] {
        &self.uncertainty_factors
    }

    pub fn recommended_actions(&self) -> &[String] {
        &self.recommended_actions
    }

    pub fn meets_baseline(&self) -> bool {
        self.meets_baseline
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
