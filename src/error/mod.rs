use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Scoring error: {0}")]
    Scoring(#[from] ScoringError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Errors raised while computing a confidence score
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    #[error("Factor {factor} out of range: {value} (expected 0.0-1.0)")]
    OutOfRange { factor: String, value: f64 },

    #[error("Weights for {set} sum to {sum}, expected 1.0")]
    InvalidWeights { set: String, sum: f64 },

    #[error("Consistency violation: {message}")]
    ConsistencyViolation { message: String },
}

/// Multi-source validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Too many validation sources: {count} (max {max})")]
    TooManySources { count: usize, max: usize },

    #[error("Duplicate validation source: {kind}")]
    DuplicateSource { kind: String },

    #[error("Source {source_name} returned out-of-range score: {score}")]
    ScoreOutOfRange { source_name: String, score: f64 },

    #[error("Source {source_name} unavailable: {message} (retries: {retries})")]
    Unavailable {
        source_name: String,
        message: String,
        retries: u32,
    },

    #[error("Source API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid source response: {message}")]
    InvalidResponse { message: String },

    #[error("Source request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors from a full scoring pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Scoring(#[from] ScoringError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Consultation gate errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GateError {
    #[error("Consultation stalled in {phase} after {attempts} clarification attempts: {reason}")]
    Stalled {
        phase: String,
        attempts: u32,
        reason: String,
    },

    #[error("Consultation already completed")]
    AlreadyCompleted,

    #[error("No confidence score computed for phase {phase}")]
    NoScore { phase: String },
}

/// Streaming reassembly errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StreamingError {
    #[error("Message {incoming} started while {active} is still active")]
    ConcurrentMessage { active: String, incoming: String },

    #[error("Unknown message: {message_id}")]
    UnknownMessage { message_id: String },
}

/// Per-session execution errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("Session closed: {session_id}")]
    Closed { session_id: String },

    #[error("Scoring failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Gate: {0}")]
    Gate(#[from] GateError),

    #[error("Streaming protocol error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("History out of order: {message}")]
    HistoryOrder { message: String },
}

/// Real-time channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    #[error("Malformed message: {message}")]
    Malformed { message: String },

    #[error("Connection timed out after {idle_secs}s without traffic")]
    DeadConnection { idle_secs: u64 },

    #[error("Reconnection attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for scoring operations
pub type ScoringResult<T> = Result<T, ScoringError>;

/// Result type alias for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Result type alias for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_scoring_error_display() {
        let err = ScoringError::OutOfRange {
            factor: "requirement_clarity".to_string(),
            value: 1.2,
        };
        assert_eq!(
            err.to_string(),
            "Factor requirement_clarity out of range: 1.2 (expected 0.0-1.0)"
        );

        let err = ScoringError::ConsistencyViolation {
            message: "empty uncertainty list".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Consistency violation: empty uncertainty list"
        );
    }

    #[test]
    fn test_gate_error_display() {
        let err = GateError::Stalled {
            phase: "architecture".to_string(),
            attempts: 10,
            reason: "confidence below baseline".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Consultation stalled in architecture after 10 clarification attempts: confidence below baseline"
        );
        assert_eq!(
            GateError::AlreadyCompleted.to_string(),
            "Consultation already completed"
        );
    }

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::ConcurrentMessage {
            active: "m1".to_string(),
            incoming: "m2".to_string(),
        };
        assert_eq!(err.to_string(), "Message m2 started while m1 is still active");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::Unavailable {
            source_name: "knowledge_base".to_string(),
            message: "server down".to_string(),
            retries: 3,
        };
        assert_eq!(
            err.to_string(),
            "Source knowledge_base unavailable: server down (retries: 3)"
        );

        let err = ValidationError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Source request timeout after 5000ms");
    }

    #[test]
    fn test_storage_error_conversion_to_app_error() {
        let storage_err = StorageError::SessionNotFound {
            session_id: "test-123".to_string(),
        };
        let app_err: AppError = storage_err.into();
        assert!(matches!(app_err, AppError::Storage(_)));
    }

    #[test]
    fn test_gate_error_conversion_to_session_error() {
        let session_err: SessionError = GateError::AlreadyCompleted.into();
        assert!(matches!(session_err, SessionError::Gate(_)));
        assert!(session_err.to_string().contains("already completed"));
    }

    #[test]
    fn test_channel_error_display() {
        let err = ChannelError::ReconnectExhausted { attempts: 5 };
        assert_eq!(
            err.to_string(),
            "Reconnection attempts exhausted after 5 attempts"
        );
    }
}
