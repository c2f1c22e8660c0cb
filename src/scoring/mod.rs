//! Confidence scoring.
//!
//! This module provides:
//! - [`ConfidenceScorer`]: weighted sum of the six confidence factors
//! - [`UncertaintyAnalyzer`]: penalty for known-unknowns and assumptions
//! - [`ConfidenceScore`]: the immutable, consistency-checked result
//! - [`ScoringPipeline`]: factor score → source blend → penalty → baseline

mod factors;
mod pipeline;
mod score;
mod uncertainty;

pub use factors::{ConfidenceFactors, ConfidenceScorer, Factor, FactorWeights, WEIGHT_EPSILON};
pub use pipeline::{PipelineOutcome, ScoringInput, ScoringPipeline};
pub use score::{meets_baseline, ConfidenceScore, BASELINE};
pub use uncertainty::{
    factor_action, Guidance, UncertaintyAnalyzer, UncertaintyInput, ASSUMPTION_PENALTY,
    MAX_PENALTY, UNKNOWN_PENALTY,
};
