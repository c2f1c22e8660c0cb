//! The full scoring pipeline.
//!
//! ```text
//! factors → weighted score → (optional) multi-source blend → penalty → clamp → baseline
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::factors::{ConfidenceFactors, ConfidenceScorer};
use super::score::ConfidenceScore;
use super::uncertainty::{UncertaintyAnalyzer, UncertaintyInput};
use crate::error::PipelineError;
use crate::validation::{BlendResult, MultiSourceValidator, ValidationSource};

/// One unit of scoring work: factor estimates, uncertainty flags and any
/// validation source scores already known to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringInput {
    pub factors: ConfidenceFactors,
    #[serde(default)]
    pub uncertainty: UncertaintyInput,
    #[serde(default)]
    pub sources: Vec<ValidationSource>,
}

impl ScoringInput {
    /// Input with factors only.
    pub fn new(factors: ConfidenceFactors) -> Self {
        Self {
            factors,
            uncertainty: UncertaintyInput::default(),
            sources: Vec::new(),
        }
    }

    /// Attach uncertainty flags.
    pub fn with_uncertainty(mut self, uncertainty: UncertaintyInput) -> Self {
        self.uncertainty = uncertainty;
        self
    }

    /// Attach validation source scores.
    pub fn with_sources(mut self, sources: Vec<ValidationSource>) -> Self {
        self.sources = sources;
        self
    }
}

/// Score plus the intermediate values that produced it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub score: ConfidenceScore,
    pub raw_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blend: Option<BlendResult>,
    pub penalty: f64,
}

/// Composes the scorer, validator and uncertainty analyzer in pipeline order.
#[derive(Debug, Clone, Default)]
pub struct ScoringPipeline {
    scorer: ConfidenceScorer,
    validator: MultiSourceValidator,
    analyzer: UncertaintyAnalyzer,
}

impl ScoringPipeline {
    /// Pipeline with the standard weight sets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline with explicit components.
    pub fn with_components(
        scorer: ConfidenceScorer,
        validator: MultiSourceValidator,
        analyzer: UncertaintyAnalyzer,
    ) -> Self {
        Self {
            scorer,
            validator,
            analyzer,
        }
    }

    /// Evaluate the input. Sources in `extra_sources` are blended together
    /// with those carried by the input itself.
    ///
    /// When at least one source is available the blended value replaces
    /// the raw factor score before the penalty is applied.
    pub fn evaluate(
        &self,
        input: &ScoringInput,
        extra_sources: &[ValidationSource],
    ) -> Result<PipelineOutcome, PipelineError> {
        let raw_score = self.scorer.score(&input.factors)?;

        let sources: Vec<ValidationSource> = input
            .sources
            .iter()
            .chain(extra_sources.iter())
            .cloned()
            .collect();
        let blend = self.validator.blend(&sources)?;
        let base = blend.as_ref().map(|b| b.blended).unwrap_or(raw_score);

        let penalty = self.analyzer.penalty_for(&input.uncertainty);
        let overall = self.analyzer.apply(base, penalty);
        let guidance = self.analyzer.guidance(&input.factors, &input.uncertainty, overall);

        debug!(
            raw_score,
            blended = ?blend.as_ref().map(|b| b.blended),
            penalty,
            overall,
            "Scoring pipeline evaluated"
        );

        let score = ConfidenceScore::new(
            overall,
            input.factors,
            guidance.boosters,
            guidance.uncertainties,
            guidance.actions,
            penalty,
            Utc::now(),
        )?;

        Ok(PipelineOutcome {
            score,
            raw_score,
            blend,
            penalty,
        })
    }
}
