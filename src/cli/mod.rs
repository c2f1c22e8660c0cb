//! Command-line interface.
//!
//! `serve` runs the realtime server (the default); `score` evaluates one
//! scoring input offline; `history` prints the stored confidence history of
//! a session.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::history::trend_of;
use crate::scoring::{ScoringInput, ScoringPipeline};
use crate::storage::Storage;

/// Confidence consultation engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "consultation-confidence", version, about)]
pub struct Cli {
    /// Subcommand to run; defaults to `serve`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run the realtime server
    Serve,

    /// Evaluate a scoring input and print the outcome as JSON
    Score {
        /// JSON file with the scoring input; reads stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Show the stored confidence history of a session
    History {
        /// Session identifier
        session_id: String,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Evaluate one JSON scoring input through the full pipeline.
pub fn execute_score(input_json: &str) -> CliResult {
    let input: ScoringInput = match serde_json::from_str(input_json) {
        Ok(input) => input,
        Err(e) => return CliResult::error(format!("Invalid scoring input: {}", e)),
    };

    let outcome = match ScoringPipeline::new().evaluate(&input, &[]) {
        Ok(outcome) => outcome,
        Err(e) => return CliResult::error(format!("Scoring failed: {}", e)),
    };

    match serde_json::to_string_pretty(&outcome) {
        Ok(json) => CliResult::success(json),
        Err(e) => CliResult::error(format!("Failed to encode outcome: {}", e)),
    }
}

/// Print a session's stored history and trend.
pub async fn execute_history(storage: &dyn Storage, session_id: &str) -> CliResult {
    let session = match storage.get_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return CliResult::error(format!("Session not found: {}", session_id)),
        Err(e) => return CliResult::error(format!("Failed to load session: {}", e)),
    };

    let points = match storage.get_history(session_id).await {
        Ok(points) => points,
        Err(e) => return CliResult::error(format!("Failed to load history: {}", e)),
    };

    let mut output = String::new();
    output.push_str(&format!("\nSession {}\n", session.id));
    output.push_str(&format!(
        "Phase: {}   Status: {}   Points: {}   Trend: {}\n\n",
        session.phase,
        session.status,
        points.len(),
        trend_of(&points)
    ));

    if points.is_empty() {
        output.push_str("  (no confidence recorded)\n");
    }
    for point in &points {
        output.push_str(&format!(
            "  {}  {:<15} {:.4}\n",
            point.timestamp.format("%Y-%m-%d %H:%M:%S"),
            point.phase.as_str(),
            point.confidence
        ));
    }

    CliResult::success(output)
}
