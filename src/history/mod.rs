//! Confidence history and trend derivation.
//!
//! One point is appended per recomputation. The trend compares the mean of
//! the last three points with the mean of the three before them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Points needed before a trend other than `stable` is reported.
pub const MIN_TREND_POINTS: usize = 6;
/// Size of each comparison window.
pub const TREND_WINDOW: usize = 3;
/// Mean difference that counts as a change.
pub const TREND_DELTA: f64 = 0.02;

/// Workflow phase, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Requirements,
    Architecture,
    Implementation,
    Testing,
    Deployment,
}

impl WorkflowPhase {
    /// All phases in workflow order.
    pub const ALL: [WorkflowPhase; 5] = [
        WorkflowPhase::Requirements,
        WorkflowPhase::Architecture,
        WorkflowPhase::Implementation,
        WorkflowPhase::Testing,
        WorkflowPhase::Deployment,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Requirements => "requirements",
            WorkflowPhase::Architecture => "architecture",
            WorkflowPhase::Implementation => "implementation",
            WorkflowPhase::Testing => "testing",
            WorkflowPhase::Deployment => "deployment",
        }
    }

    /// The following phase, `None` for deployment.
    pub fn next(&self) -> Option<WorkflowPhase> {
        match self {
            WorkflowPhase::Requirements => Some(WorkflowPhase::Architecture),
            WorkflowPhase::Architecture => Some(WorkflowPhase::Implementation),
            WorkflowPhase::Implementation => Some(WorkflowPhase::Testing),
            WorkflowPhase::Testing => Some(WorkflowPhase::Deployment),
            WorkflowPhase::Deployment => None,
        }
    }

    /// Zero-based position in the workflow.
    pub fn index(&self) -> usize {
        match self {
            WorkflowPhase::Requirements => 0,
            WorkflowPhase::Architecture => 1,
            WorkflowPhase::Implementation => 2,
            WorkflowPhase::Testing => 3,
            WorkflowPhase::Deployment => 4,
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requirements" => Ok(WorkflowPhase::Requirements),
            "architecture" => Ok(WorkflowPhase::Architecture),
            "implementation" => Ok(WorkflowPhase::Implementation),
            "testing" => Ok(WorkflowPhase::Testing),
            "deployment" => Ok(WorkflowPhase::Deployment),
            _ => Err(format!("Unknown workflow phase: {}", s)),
        }
    }
}

/// One recorded confidence value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceHistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub phase: WorkflowPhase,
}

/// Direction of recent confidence movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

impl Trend {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Improving => "improving",
            Trend::Declining => "declining",
            Trend::Stable => "stable",
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only, time-ordered confidence history of one session.
#[derive(Debug, Clone, Default)]
pub struct HistoryTracker {
    points: Vec<ConfidenceHistoryPoint>,
}

impl HistoryTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted points. They must already be time-ordered.
    pub fn from_points(points: Vec<ConfidenceHistoryPoint>) -> SessionResult<Self> {
        let mut tracker = Self::new();
        for point in points {
            tracker.push(point)?;
        }
        Ok(tracker)
    }

    /// Append a point. A timestamp earlier than the last point is rejected.
    pub fn push(&mut self, point: ConfidenceHistoryPoint) -> SessionResult<()> {
        if let Some(last) = self.points.last() {
            if point.timestamp < last.timestamp {
                return Err(SessionError::HistoryOrder {
                    message: format!(
                        "point at {} precedes last point at {}",
                        point.timestamp, last.timestamp
                    ),
                });
            }
        }
        self.points.push(point);
        Ok(())
    }

    /// Point for a confidence value observed now, without appending it.
    ///
    /// If the clock stepped backwards the last timestamp is reused so the
    /// series stays ordered.
    pub fn next_point(&self, confidence: f64, phase: WorkflowPhase) -> ConfidenceHistoryPoint {
        let now = Utc::now();
        let timestamp = match self.points.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        ConfidenceHistoryPoint {
            timestamp,
            confidence,
            phase,
        }
    }

    /// Record a confidence value now.
    pub fn record(&mut self, confidence: f64, phase: WorkflowPhase) -> ConfidenceHistoryPoint {
        let point = self.next_point(confidence, phase);
        self.points.push(point.clone());
        point
    }

    /// All points, oldest first.
    pub fn points(&self) -> &[ConfidenceHistoryPoint] {
        &self.points
    }

    /// Most recent point.
    pub fn latest(&self) -> Option<&ConfidenceHistoryPoint> {
        self.points.last()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Trend over the last six points.
    pub fn trend(&self) -> Trend {
        trend_of(&self.points)
    }
}

/// Trend of an arbitrary point series.
pub fn trend_of(points: &[ConfidenceHistoryPoint]) -> Trend {
    if points.len() < MIN_TREND_POINTS {
        return Trend::Stable;
    }

    let n = points.len();
    let mean = |window: &[ConfidenceHistoryPoint]| {
        window.iter().map(|p| p.confidence).sum::<f64>() / window.len() as f64
    };
    let recent = mean(&points[n - TREND_WINDOW..]);
    let prior = mean(&points[n - 2 * TREND_WINDOW..n - TREND_WINDOW]);
    let delta = recent - prior;

    if delta > TREND_DELTA {
        Trend::Improving
    } else if delta < -TREND_DELTA {
        Trend::Declining
    } else {
        Trend::Stable
    }
}
