//! Uncertainty penalty model and the guidance lookup table.
//!
//! Each known-unknown costs 0.03 and each assumption 0.02, capped at 0.20.
//! The same inputs, together with the factor values, are mapped to the
//! human-readable boosters, uncertainty factors and recommended actions
//! carried by a [`ConfidenceScore`](super::ConfidenceScore).

use serde::{Deserialize, Serialize};

use super::factors::{ConfidenceFactors, Factor};
use super::score::BASELINE;

/// Penalty per known-unknown.
pub const UNKNOWN_PENALTY: f64 = 0.03;
/// Penalty per assumption.
pub const ASSUMPTION_PENALTY: f64 = 0.02;
/// Upper bound of the total penalty.
pub const MAX_PENALTY: f64 = 0.20;

/// Factors at or above this value are reported as boosters.
pub const BOOSTER_THRESHOLD: f64 = 0.90;
/// Factors below this value are reported as low (otherwise moderate).
pub const LOW_FACTOR_THRESHOLD: f64 = 0.70;

/// Known-unknowns and assumptions attached to a scoring request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UncertaintyInput {
    #[serde(default)]
    pub known_unknowns: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
}

impl UncertaintyInput {
    /// Create from explicit lists.
    pub fn new(known_unknowns: Vec<String>, assumptions: Vec<String>) -> Self {
        Self {
            known_unknowns,
            assumptions,
        }
    }

    /// No unknowns and no assumptions.
    pub fn none() -> Self {
        Self::default()
    }

    /// True when nothing reduces confidence.
    pub fn is_empty(&self) -> bool {
        self.known_unknowns.is_empty() && self.assumptions.is_empty()
    }
}

/// Display lists derived for one score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guidance {
    pub boosters: Vec<String>,
    pub uncertainties: Vec<String>,
    pub actions: Vec<String>,
}

/// Computes the uncertainty penalty and the guidance lists.
#[derive(Debug, Clone, Default)]
pub struct UncertaintyAnalyzer;

impl UncertaintyAnalyzer {
    /// Create a new analyzer.
    pub fn new() -> Self {
        Self
    }

    /// penalty = min(0.20, 0.03K + 0.02A)
    pub fn penalty(&self, known_unknowns: usize, assumptions: usize) -> f64 {
        let penalty =
            known_unknowns as f64 * UNKNOWN_PENALTY + assumptions as f64 * ASSUMPTION_PENALTY;
        penalty.min(MAX_PENALTY)
    }

    /// Penalty for a full uncertainty input.
    pub fn penalty_for(&self, input: &UncertaintyInput) -> f64 {
        self.penalty(input.known_unknowns.len(), input.assumptions.len())
    }

    /// final = clamp(raw - penalty, 0, 1)
    pub fn apply(&self, raw: f64, penalty: f64) -> f64 {
        (raw - penalty).clamp(0.0, 1.0)
    }

    /// Build boosters, uncertainty factors and recommended actions.
    ///
    /// Factor guidance comes from a fixed table; every unknown and
    /// assumption contributes one uncertainty string and one action. While
    /// the final score is below baseline, a booster that is itself below
    /// baseline still gets its factor action. When
    /// the final score is below 1.0 and nothing else was reported, the
    /// weakest factor is listed as a residual gap so the uncertainty list
    /// is never empty for an imperfect score.
    pub fn guidance(
        &self,
        factors: &ConfidenceFactors,
        input: &UncertaintyInput,
        final_score: f64,
    ) -> Guidance {
        let mut guidance = Guidance::default();
        let below_baseline = final_score < BASELINE;

        for (factor, value) in factors.iter() {
            if value >= BOOSTER_THRESHOLD {
                guidance
                    .boosters
                    .push(format!("Strong {} ({:.2})", factor.label(), value));
                if below_baseline && value < BASELINE {
                    guidance.actions.push(factor_action(factor).to_string());
                }
            } else {
                let level = if value < LOW_FACTOR_THRESHOLD {
                    "Low"
                } else {
                    "Moderate"
                };
                guidance
                    .uncertainties
                    .push(format!("{} {} ({:.2})", level, factor.label(), value));
                guidance.actions.push(factor_action(factor).to_string());
            }
        }

        for unknown in &input.known_unknowns {
            guidance.uncertainties.push(format!("Unknown: {}", unknown));
            guidance.actions.push(format!("Resolve unknown: {}", unknown));
        }

        for assumption in &input.assumptions {
            guidance.uncertainties.push(format!("Assumption: {}", assumption));
            guidance
                .actions
                .push(format!("Validate assumption: {}", assumption));
        }

        if final_score < 1.0 && guidance.uncertainties.is_empty() {
            let (factor, value) = factors.weakest();
            guidance
                .uncertainties
                .push(format!("Residual gap in {} ({:.2})", factor.label(), value));
        }

        guidance
    }
}

/// Recommended action for a factor that holds the score down.
pub fn factor_action(factor: Factor) -> &'static str {
    match factor {
        Factor::InformationCompleteness => {
            "Gather the missing project information: scope, constraints and stakeholders"
        }
        Factor::RequirementClarity => "Clarify ambiguous requirements with the user",
        Factor::TechnicalFeasibility => "Review the technical feasibility of the proposed approach",
        Factor::ValidationCoverage => {
            "Cross-check the recommendation against additional validation sources"
        }
        Factor::RiskAssessment => "Complete the risk assessment for the identified risks",
        Factor::UserAlignment => "Confirm the proposal matches the user's goals and priorities",
    }
}
