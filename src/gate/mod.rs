//! Consultation gate.
//!
//! A linear state machine over the workflow phases. A transition is only
//! allowed when the current score meets the baseline; otherwise the gate
//! enters a clarification loop that surfaces recommended actions and waits
//! for new input. The loop is bounded: when the attempt budget runs out, or
//! when there is no guidance to offer, the consultation is stalled.
//!
//! # States
//!
//! ```text
//! Active ──blocked──▶ AwaitingClarification ──baseline met──▶ Active ──▶ … ──▶ Completed
//!                            │
//!                            └──attempts exhausted / no actions──▶ Stalled
//! ```

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GateError;
use crate::history::WorkflowPhase;
use crate::scoring::ConfidenceScore;

/// Default clarification attempt budget per phase.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Lifecycle status of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Ready to attempt the next transition.
    Active,
    /// Blocked below baseline, waiting for clarification input.
    AwaitingClarification,
    /// Deployment reached.
    Completed,
    /// Clarification loop gave up.
    Stalled,
}

impl GateStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Active => "active",
            GateStatus::AwaitingClarification => "awaiting_clarification",
            GateStatus::Completed => "completed",
            GateStatus::Stalled => "stalled",
        }
    }

    /// Completed and stalled are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateStatus::Completed | GateStatus::Stalled)
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(GateStatus::Active),
            "awaiting_clarification" => Ok(GateStatus::AwaitingClarification),
            "completed" => Ok(GateStatus::Completed),
            "stalled" => Ok(GateStatus::Stalled),
            _ => Err(format!("Unknown gate status: {}", s)),
        }
    }
}

/// Result of a transition attempt that did not stall.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// The workflow moved on.
    Advanced {
        from: WorkflowPhase,
        to: WorkflowPhase,
    },
    /// Below baseline; the caller must clarify and retry.
    Blocked {
        recommended_actions: Vec<String>,
        attempt: u32,
        max_attempts: u32,
    },
}

/// Phase gate of one session.
#[derive(Debug, Clone)]
pub struct ConsultationGate {
    phase: WorkflowPhase,
    status: GateStatus,
    attempts: u32,
    max_attempts: u32,
    pending_actions: Vec<String>,
    stall_reason: Option<String>,
}

impl ConsultationGate {
    /// Gate at the requirements phase.
    pub fn new(max_attempts: u32) -> Self {
        Self::restore(WorkflowPhase::Requirements, GateStatus::Active, max_attempts)
    }

    /// Gate resumed from persisted state.
    pub fn restore(phase: WorkflowPhase, status: GateStatus, max_attempts: u32) -> Self {
        Self {
            phase,
            status,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            pending_actions: Vec::new(),
            stall_reason: (status == GateStatus::Stalled)
                .then(|| "stalled before restart".to_string()),
        }
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.phase
    }

    pub fn status(&self) -> GateStatus {
        self.status
    }

    /// Clarification attempts used in the current phase.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Actions surfaced by the last blocked attempt.
    pub fn pending_actions(&self) -> &[String] {
        &self.pending_actions
    }

    /// True while a clarification answer is expected.
    pub fn awaiting_clarification(&self) -> bool {
        self.status == GateStatus::AwaitingClarification
    }

    /// Whether a transition would be allowed right now.
    pub fn can_advance(&self, score: Option<&ConfidenceScore>) -> bool {
        !self.status.is_terminal()
            && self.phase.next().is_some()
            && score.map(|s| s.meets_baseline()).unwrap_or(false)
    }

    /// Actions the upstream collaborator should act on.
    ///
    /// Empty when the score already meets the baseline.
    pub fn request_clarification(
        &self,
        score: Option<&ConfidenceScore>,
    ) -> Result<Vec<String>, GateError> {
        self.ensure_open()?;
        let score = score.ok_or_else(|| GateError::NoScore {
            phase: self.phase.to_string(),
        })?;
        if score.meets_baseline() {
            return Ok(Vec::new());
        }
        Ok(score.recommended_actions().to_vec())
    }

    /// Try to move to the next phase.
    ///
    /// Every blocked attempt consumes one unit of the clarification budget.
    /// Running out of budget, or being blocked without any recommended
    /// action, stalls the consultation.
    pub fn attempt_transition(
        &mut self,
        score: Option<&ConfidenceScore>,
    ) -> Result<GateDecision, GateError> {
        self.ensure_open()?;
        let score = score.ok_or_else(|| GateError::NoScore {
            phase: self.phase.to_string(),
        })?;

        if score.meets_baseline() {
            let from = self.phase;
            let to = match from.next() {
                Some(next) => next,
                None => {
                    self.status = GateStatus::Completed;
                    return Err(GateError::AlreadyCompleted);
                }
            };
            self.phase = to;
            self.attempts = 0;
            self.pending_actions.clear();
            self.status = if to.next().is_none() {
                GateStatus::Completed
            } else {
                GateStatus::Active
            };
            info!(
                from = %from,
                to = %to,
                confidence = score.overall_confidence(),
                "Phase transition allowed"
            );
            return Ok(GateDecision::Advanced { from, to });
        }

        self.attempts += 1;
        let actions = score.recommended_actions().to_vec();

        if actions.is_empty() {
            return Err(self.stall(format!(
                "confidence {:.4} below baseline with no recommended actions",
                score.overall_confidence()
            )));
        }

        if self.attempts >= self.max_attempts {
            return Err(self.stall(format!(
                "confidence {:.4} still below baseline",
                score.overall_confidence()
            )));
        }

        warn!(
            phase = %self.phase,
            confidence = score.overall_confidence(),
            attempt = self.attempts,
            max_attempts = self.max_attempts,
            actions = actions.len(),
            "Phase transition blocked, clarification required"
        );
        self.status = GateStatus::AwaitingClarification;
        self.pending_actions = actions.clone();

        Ok(GateDecision::Blocked {
            recommended_actions: actions,
            attempt: self.attempts,
            max_attempts: self.max_attempts,
        })
    }

    /// Fails with the terminal error once completed or stalled.
    pub fn ensure_open(&self) -> Result<(), GateError> {
        match self.status {
            GateStatus::Completed => Err(GateError::AlreadyCompleted),
            GateStatus::Stalled => Err(self.stalled_error()),
            _ => Ok(()),
        }
    }

    fn stall(&mut self, reason: String) -> GateError {
        warn!(
            phase = %self.phase,
            attempts = self.attempts,
            reason = %reason,
            "Consultation stalled"
        );
        self.status = GateStatus::Stalled;
        self.pending_actions.clear();
        self.stall_reason = Some(reason);
        self.stalled_error()
    }

    fn stalled_error(&self) -> GateError {
        GateError::Stalled {
            phase: self.phase.to_string(),
            attempts: self.attempts,
            reason: self
                .stall_reason
                .clone()
                .unwrap_or_else(|| "stalled".to_string()),
        }
    }
}

impl Default for ConsultationGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}
