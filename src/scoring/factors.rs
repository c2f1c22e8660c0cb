//! Confidence factors and the weighted factor scorer.

use serde::{Deserialize, Serialize};

use crate::error::{ScoringError, ScoringResult};

/// Tolerance used when checking that a weight set sums to 1.0.
pub const WEIGHT_EPSILON: f64 = 1e-9;

/// One of the six weighted inputs to the raw score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    /// How much of the needed project information has been gathered.
    InformationCompleteness,
    /// How unambiguous the stated requirements are.
    RequirementClarity,
    /// Whether the proposed approach can be built.
    TechnicalFeasibility,
    /// How much of the recommendation has been cross-checked.
    ValidationCoverage,
    /// How completely the known risks have been assessed.
    RiskAssessment,
    /// How well the proposal matches the user's goals.
    UserAlignment,
}

impl Factor {
    /// All factors in weight order.
    pub const ALL: [Factor; 6] = [
        Factor::InformationCompleteness,
        Factor::RequirementClarity,
        Factor::TechnicalFeasibility,
        Factor::ValidationCoverage,
        Factor::RiskAssessment,
        Factor::UserAlignment,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Factor::InformationCompleteness => "information_completeness",
            Factor::RequirementClarity => "requirement_clarity",
            Factor::TechnicalFeasibility => "technical_feasibility",
            Factor::ValidationCoverage => "validation_coverage",
            Factor::RiskAssessment => "risk_assessment",
            Factor::UserAlignment => "user_alignment",
        }
    }

    /// Human-readable label used in boosters and uncertainty strings.
    pub fn label(&self) -> &'static str {
        match self {
            Factor::InformationCompleteness => "information completeness",
            Factor::RequirementClarity => "requirement clarity",
            Factor::TechnicalFeasibility => "technical feasibility",
            Factor::ValidationCoverage => "validation coverage",
            Factor::RiskAssessment => "risk assessment",
            Factor::UserAlignment => "user alignment",
        }
    }
}

impl std::fmt::Display for Factor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The six factor estimates, each expected in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceFactors {
    pub information_completeness: f64,
    pub requirement_clarity: f64,
    pub technical_feasibility: f64,
    pub validation_coverage: f64,
    pub risk_assessment: f64,
    pub user_alignment: f64,
}

impl ConfidenceFactors {
    /// Create factors in weight order.
    pub fn new(
        information_completeness: f64,
        requirement_clarity: f64,
        technical_feasibility: f64,
        validation_coverage: f64,
        risk_assessment: f64,
        user_alignment: f64,
    ) -> Self {
        Self {
            information_completeness,
            requirement_clarity,
            technical_feasibility,
            validation_coverage,
            risk_assessment,
            user_alignment,
        }
    }

    /// Every factor set to the same value.
    pub fn uniform(value: f64) -> Self {
        Self::new(value, value, value, value, value, value)
    }

    /// Value of a single factor.
    pub fn get(&self, factor: Factor) -> f64 {
        match factor {
            Factor::InformationCompleteness => self.information_completeness,
            Factor::RequirementClarity => self.requirement_clarity,
            Factor::TechnicalFeasibility => self.technical_feasibility,
            Factor::ValidationCoverage => self.validation_coverage,
            Factor::RiskAssessment => self.risk_assessment,
            Factor::UserAlignment => self.user_alignment,
        }
    }

    /// Iterate `(factor, value)` pairs in weight order.
    pub fn iter(&self) -> impl Iterator<Item = (Factor, f64)> + '_ {
        Factor::ALL.iter().map(move |f| (*f, self.get(*f)))
    }

    /// Reject any factor outside [0, 1]. NaN is rejected too.
    pub fn validate(&self) -> ScoringResult<()> {
        for (factor, value) in self.iter() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ScoringError::OutOfRange {
                    factor: factor.as_str().to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// The factor with the lowest value (first in weight order on ties).
    pub fn weakest(&self) -> (Factor, f64) {
        self.iter()
            .fold((Factor::InformationCompleteness, f64::INFINITY), |acc, (f, v)| {
                if v < acc.1 {
                    (f, v)
                } else {
                    acc
                }
            })
    }
}

/// Fixed weights of the six confidence factors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorWeights {
    pub information_completeness: f64,
    pub requirement_clarity: f64,
    pub technical_feasibility: f64,
    pub validation_coverage: f64,
    pub risk_assessment: f64,
    pub user_alignment: f64,
}

impl FactorWeights {
    /// The production weight set: 0.25, 0.20, 0.20, 0.15, 0.10, 0.10.
    pub const STANDARD: FactorWeights = FactorWeights {
        information_completeness: 0.25,
        requirement_clarity: 0.20,
        technical_feasibility: 0.20,
        validation_coverage: 0.15,
        risk_assessment: 0.10,
        user_alignment: 0.10,
    };

    /// Weight of a single factor.
    pub fn weight(&self, factor: Factor) -> f64 {
        match factor {
            Factor::InformationCompleteness => self.information_completeness,
            Factor::RequirementClarity => self.requirement_clarity,
            Factor::TechnicalFeasibility => self.technical_feasibility,
            Factor::ValidationCoverage => self.validation_coverage,
            Factor::RiskAssessment => self.risk_assessment,
            Factor::UserAlignment => self.user_alignment,
        }
    }

    /// Sum of all six weights.
    pub fn sum(&self) -> f64 {
        Factor::ALL.iter().map(|f| self.weight(*f)).sum()
    }

    /// Check that every weight is non-negative and the set sums to 1.0.
    pub fn validate(&self) -> ScoringResult<()> {
        let sum = self.sum();
        let negative = Factor::ALL.iter().any(|f| self.weight(*f) < 0.0);
        if negative || (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(ScoringError::InvalidWeights {
                set: "confidence factors".to_string(),
                sum,
            });
        }
        Ok(())
    }
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Weighted sum of the confidence factors.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    weights: FactorWeights,
}

impl ConfidenceScorer {
    /// Create a scorer with the standard weights.
    pub fn new() -> Self {
        Self {
            weights: FactorWeights::STANDARD,
        }
    }

    /// Create a scorer with a custom weight set, rejected unless it sums to 1.0.
    pub fn with_weights(weights: FactorWeights) -> ScoringResult<Self> {
        weights.validate()?;
        Ok(Self { weights })
    }

    /// Raw overall score: the sum of factor x weight.
    ///
    /// Callers must clamp or reject their inputs first; out-of-range factors
    /// are an error, never silently clamped.
    pub fn score(&self, factors: &ConfidenceFactors) -> ScoringResult<f64> {
        factors.validate()?;
        Ok(factors
            .iter()
            .map(|(factor, value)| value * self.weights.weight(factor))
            .sum())
    }

    /// Get the weights in use.
    pub fn weights(&self) -> &FactorWeights {
        &self.weights
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new()
    }
}
