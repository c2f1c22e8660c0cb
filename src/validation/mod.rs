//! Multi-source cross-validation.
//!
//! Up to four independent knowledge sources score the current consultation
//! state. Their scores are blended with fixed weights, re-normalized over
//! whichever sources actually answered, and rewarded with a flat bonus
//! when they agree closely.

mod client;
mod source;

pub use client::{build_sources, HttpKnowledgeSource};
pub use source::{KnowledgeSource, SourceRequest, StaticSource};

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{ScoringError, ScoringResult, ValidationError, ValidationResult};
use crate::scoring::WEIGHT_EPSILON;

/// Maximum number of sources per validation call.
pub const MAX_SOURCES: usize = 4;
/// Agreement above this value earns the bonus.
pub const AGREEMENT_THRESHOLD: f64 = 0.90;
/// Flat bonus for agreeing sources.
pub const AGREEMENT_BONUS: f64 = 0.05;

/// Category of a validation source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Knowledge-base queries.
    KnowledgeBase,
    /// Semantic / vector search.
    VectorSearch,
    /// Architecture-framework rules.
    ArchitectureRules,
    /// Cost models.
    CostModel,
}

impl SourceKind {
    /// All source kinds.
    pub const ALL: [SourceKind; 4] = [
        SourceKind::KnowledgeBase,
        SourceKind::VectorSearch,
        SourceKind::ArchitectureRules,
        SourceKind::CostModel,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::KnowledgeBase => "knowledge_base",
            SourceKind::VectorSearch => "vector_search",
            SourceKind::ArchitectureRules => "architecture_rules",
            SourceKind::CostModel => "cost_model",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "knowledge_base" => Ok(SourceKind::KnowledgeBase),
            "vector_search" => Ok(SourceKind::VectorSearch),
            "architecture_rules" => Ok(SourceKind::ArchitectureRules),
            "cost_model" => Ok(SourceKind::CostModel),
            _ => Err(format!("Unknown source kind: {}", s)),
        }
    }
}

/// Fixed weights of the four source categories.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceWeights {
    pub knowledge_base: f64,
    pub vector_search: f64,
    pub architecture_rules: f64,
    pub cost_model: f64,
}

impl SourceWeights {
    /// The production weight set: 0.30, 0.25, 0.25, 0.20.
    pub const STANDARD: SourceWeights = SourceWeights {
        knowledge_base: 0.30,
        vector_search: 0.25,
        architecture_rules: 0.25,
        cost_model: 0.20,
    };

    /// Weight of one source kind.
    pub fn weight(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::KnowledgeBase => self.knowledge_base,
            SourceKind::VectorSearch => self.vector_search,
            SourceKind::ArchitectureRules => self.architecture_rules,
            SourceKind::CostModel => self.cost_model,
        }
    }

    /// Sum of all four weights.
    pub fn sum(&self) -> f64 {
        SourceKind::ALL.iter().map(|k| self.weight(*k)).sum()
    }

    /// Check that every weight is non-negative and the set sums to 1.0.
    pub fn validate(&self) -> ScoringResult<()> {
        let sum = self.sum();
        let negative = SourceKind::ALL.iter().any(|k| self.weight(*k) < 0.0);
        if negative || (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(ScoringError::InvalidWeights {
                set: "validation sources".to_string(),
                sum,
            });
        }
        Ok(())
    }
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// One source's contribution to a validation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSource {
    pub name: String,
    pub kind: SourceKind,
    pub weight: f64,
    pub score: f64,
}

impl ValidationSource {
    /// Source scored by `kind`, carrying the standard weight.
    pub fn new(kind: SourceKind, score: f64) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            weight: SourceWeights::STANDARD.weight(kind),
            score,
        }
    }

    /// Override the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Outcome of blending the available sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlendResult {
    /// Blended score, bonus included, capped at 1.0.
    pub blended: f64,
    /// 1 - max deviation from the mean.
    pub agreement: f64,
    /// Whether the agreement bonus was added.
    pub bonus_applied: bool,
    /// Kinds that contributed.
    pub sources_used: Vec<SourceKind>,
    /// Kinds that did not respond.
    pub missing: Vec<SourceKind>,
}

/// 1 - max |score - mean|. A single score agrees with itself.
pub fn agreement(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let max_dev = scores
        .iter()
        .map(|s| (s - mean).abs())
        .fold(0.0_f64, f64::max);
    1.0 - max_dev
}

/// Blends validation source scores into one confidence value.
#[derive(Debug, Clone, Default)]
pub struct MultiSourceValidator {
    weights: SourceWeights,
}

impl MultiSourceValidator {
    /// Validator with the standard weights.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validator with a custom weight set, rejected unless it sums to 1.0.
    pub fn with_weights(weights: SourceWeights) -> ScoringResult<Self> {
        weights.validate()?;
        Ok(Self { weights })
    }

    /// Get the weights in use.
    pub fn weights(&self) -> &SourceWeights {
        &self.weights
    }

    /// Blend the available sources.
    ///
    /// Returns `Ok(None)` when no source is available; the caller then keeps
    /// the factor score. Missing sources are not an error: weights are
    /// re-normalized over the subset that responded.
    pub fn blend(&self, sources: &[ValidationSource]) -> ValidationResult<Option<BlendResult>> {
        if sources.len() > MAX_SOURCES {
            return Err(ValidationError::TooManySources {
                count: sources.len(),
                max: MAX_SOURCES,
            });
        }

        let mut seen = HashSet::new();
        for source in sources {
            if !seen.insert(source.kind) {
                return Err(ValidationError::DuplicateSource {
                    kind: source.kind.to_string(),
                });
            }
            if !(0.0..=1.0).contains(&source.score) {
                return Err(ValidationError::ScoreOutOfRange {
                    source_name: source.name.clone(),
                    score: source.score,
                });
            }
        }

        let missing: Vec<SourceKind> = SourceKind::ALL
            .iter()
            .copied()
            .filter(|k| !seen.contains(k))
            .collect();

        if sources.is_empty() {
            debug!("No validation sources available, keeping factor score");
            return Ok(None);
        }

        if !missing.is_empty() {
            warn!(
                available = sources.len(),
                missing = ?missing,
                "Validation degraded, re-normalizing source weights"
            );
        }

        let total_weight: f64 = sources.iter().map(|s| self.weights.weight(s.kind)).sum();
        let mut blended = if total_weight > 0.0 {
            sources
                .iter()
                .map(|s| s.score * self.weights.weight(s.kind) / total_weight)
                .sum()
        } else {
            sources.iter().map(|s| s.score).sum::<f64>() / sources.len() as f64
        };

        let scores: Vec<f64> = sources.iter().map(|s| s.score).collect();
        let agreement = agreement(&scores);
        let bonus_applied = sources.len() >= 2 && agreement > AGREEMENT_THRESHOLD;
        if bonus_applied {
            blended += AGREEMENT_BONUS;
        }
        let blended = blended.clamp(0.0, 1.0);

        debug!(
            blended,
            agreement,
            bonus_applied,
            sources = sources.len(),
            "Validation sources blended"
        );

        Ok(Some(BlendResult {
            blended,
            agreement,
            bonus_applied,
            sources_used: sources.iter().map(|s| s.kind).collect(),
            missing,
        }))
    }

    /// Query every configured source concurrently, keeping those that answer.
    ///
    /// A failing source is logged as degraded and left out.
    pub async fn gather(
        &self,
        sources: &[Arc<dyn KnowledgeSource>],
        request: &SourceRequest,
    ) -> Vec<ValidationSource> {
        let mut tasks = JoinSet::new();
        for (index, source) in sources.iter().enumerate() {
            let source = Arc::clone(source);
            let request = request.clone();
            tasks.spawn(async move {
                let kind = source.kind();
                (index, kind, source.score(&request).await)
            });
        }

        let mut answered = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, kind, Ok(score))) => {
                    answered.push((index, ValidationSource::new(kind, score)));
                }
                Ok((_, kind, Err(e))) => {
                    warn!(source = %kind, error = %e, "Validation source unavailable, degrading");
                }
                Err(e) => {
                    warn!(error = %e, "Validation source task failed, degrading");
                }
            }
        }

        // Keep configuration order so the blend is deterministic.
        answered.sort_by_key(|(index, _)| *index);
        answered.into_iter().map(|(_, source)| source).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_sources(scores: [f64; 4]) -> Vec<ValidationSource> {
        SourceKind::ALL
            .iter()
            .zip(scores)
            .map(|(kind, score)| ValidationSource::new(*kind, score))
            .collect()
    }

    #[test]
    fn test_standard_weights_sum_to_one() {
        assert!((SourceWeights::STANDARD.sum() - 1.0).abs() < 1e-12);
        assert!(SourceWeights::STANDARD.validate().is_ok());
    }

    #[test]
    fn test_custom_weights_must_sum_to_one() {
        let weights = SourceWeights {
            cost_model: 0.5,
            ..SourceWeights::STANDARD
        };
        assert!(MultiSourceValidator::with_weights(weights).is_err());
    }

    #[test]
    fn test_agreeing_sources_get_bonus() {
        let result = MultiSourceValidator::new()
            .blend(&all_sources([0.90, 0.92, 0.91, 0.89]))
            .unwrap()
            .unwrap();
        let base = 0.90 * 0.30 + 0.92 * 0.25 + 0.91 * 0.25 + 0.89 * 0.20;
        assert!(result.bonus_applied);
        assert!(result.agreement > AGREEMENT_THRESHOLD);
        assert!((result.blended - (base + AGREEMENT_BONUS)).abs() < 1e-9);
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_bonus_capped_at_one() {
        let result = MultiSourceValidator::new()
            .blend(&all_sources([0.98, 0.99, 0.97, 0.98]))
            .unwrap()
            .unwrap();
        assert!(result.bonus_applied);
        assert_eq!(result.blended, 1.0);
    }

    #[test]
    fn test_disagreeing_sources_get_no_bonus() {
        let result = MultiSourceValidator::new()
            .blend(&all_sources([0.95, 0.60, 0.90, 0.85]))
            .unwrap()
            .unwrap();
        assert!(!result.bonus_applied);
        let base = 0.95 * 0.30 + 0.60 * 0.25 + 0.90 * 0.25 + 0.85 * 0.20;
        assert!((result.blended - base).abs() < 1e-9);
    }

    #[test]
    fn test_two_sources_renormalize() {
        let sources = vec![
            ValidationSource::new(SourceKind::KnowledgeBase, 0.8),
            ValidationSource::new(SourceKind::CostModel, 0.4),
        ];
        let result = MultiSourceValidator::new().blend(&sources).unwrap().unwrap();
        // weights 0.30 and 0.20 renormalize to 0.6 and 0.4
        assert!((result.blended - (0.8 * 0.6 + 0.4 * 0.4)).abs() < 1e-9);
        assert!(!result.bonus_applied);
        assert_eq!(
            result.missing,
            vec![SourceKind::VectorSearch, SourceKind::ArchitectureRules]
        );
    }

    #[test]
    fn test_no_sources_yields_none() {
        assert!(MultiSourceValidator::new().blend(&[]).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let sources = vec![
            ValidationSource::new(SourceKind::VectorSearch, 0.8),
            ValidationSource::new(SourceKind::VectorSearch, 0.7),
        ];
        let err = MultiSourceValidator::new().blend(&sources).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateSource { .. }));
    }

    #[test]
    fn test_out_of_range_source_rejected() {
        let sources = vec![ValidationSource::new(SourceKind::VectorSearch, 1.3)];
        let err = MultiSourceValidator::new().blend(&sources).unwrap_err();
        assert!(matches!(err, ValidationError::ScoreOutOfRange { .. }));
    }

    #[test]
    fn test_agreement_definition() {
        assert_eq!(agreement(&[0.5]), 1.0);
        assert!((agreement(&[0.8, 1.0]) - 0.9).abs() < 1e-12);
        assert_eq!(agreement(&[]), 0.0);
    }

    #[test]
    fn test_source_kind_string_conversion() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("unknown".parse::<SourceKind>().is_err());
    }

    #[tokio::test]
    async fn test_gather_skips_failing_sources() {
        let sources: Vec<Arc<dyn KnowledgeSource>> = vec![
            Arc::new(StaticSource::new(SourceKind::KnowledgeBase, 0.9)),
            Arc::new(StaticSource::unavailable(SourceKind::VectorSearch)),
            Arc::new(StaticSource::new(SourceKind::CostModel, 0.7)),
        ];
        let request = SourceRequest::new("s1", crate::scoring::ConfidenceFactors::uniform(0.9));
        let gathered = MultiSourceValidator::new().gather(&sources, &request).await;
        assert_eq!(gathered.len(), 2);
        assert_eq!(gathered[0].kind, SourceKind::KnowledgeBase);
        assert_eq!(gathered[1].kind, SourceKind::CostModel);
    }
}
