//! # Confidence Consultation Engine
//!
//! Computes a trustworthiness score for the current state of a guided
//! consultation, decides whether the workflow may advance to its next phase,
//! and streams scores and partial AI responses to a connected client.
//!
//! ## Features
//!
//! - **Weighted scoring**: six named factors with fixed weights
//! - **Uncertainty penalty**: known-unknowns and assumptions lower confidence
//! - **Cross-validation**: up to four knowledge sources blended with an agreement bonus
//! - **Phase gate**: transitions blocked below the 0.95 baseline, bounded clarification loop
//! - **History**: append-only confidence series with trend detection
//! - **Streaming**: idempotent reassembly of ordered response chunks
//! - **Realtime channel**: heartbeat, reconnection with backoff, snapshot on (re)connect
//!
//! ## Architecture
//!
//! ```text
//! factors → ConfidenceScorer → MultiSourceValidator → UncertaintyAnalyzer → clamp
//!                                                                             ↓
//!   client ⇄ RealtimeServer ⇄ SessionWorker (gate, history, assembler) → SQLite
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use consultation_confidence::{Config, RealtimeServer, SessionManager};
//! use consultation_confidence::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let manager = Arc::new(SessionManager::new(storage, Vec::new(), &config.gate, &config.session));
//!     let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
//!     RealtimeServer::new(manager, config.realtime.clone())
//!         .serve(listener, std::future::pending())
//!         .await?;
//!     Ok(())
//! }
//! ```

/// Command-line interface.
pub mod cli;
/// Configuration management.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Phase gate and clarification loop.
pub mod gate;
/// Confidence history and trend.
pub mod history;
/// Realtime transport.
pub mod realtime;
/// Scoring pipeline.
pub mod scoring;
/// Per-session workers and the session registry.
pub mod session;
/// SQLite storage layer for persistence.
pub mod storage;
/// Streamed response reassembly.
pub mod streaming;
/// Multi-source cross-validation.
pub mod validation;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use realtime::RealtimeServer;
pub use session::{SessionHandle, SessionManager};
