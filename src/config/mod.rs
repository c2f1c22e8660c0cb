use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub gate: GateConfig,
    pub session: SessionConfig,
    pub request: RequestConfig,
    pub sources: SourceConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Listener configuration for the real-time server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// Heartbeat and reconnection settings for the real-time channel
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub heartbeat_interval_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,
}

/// Consultation gate settings
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub max_clarification_attempts: u32,
}

/// Per-session worker settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_capacity: usize,
}

/// HTTP request configuration for validation sources
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Base URLs of the remote validation sources. A missing URL disables that source.
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    pub knowledge_base_url: Option<String>,
    pub vector_search_url: Option<String>,
    pub architecture_rules_url: Option<String>,
    pub cost_model_url: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_url(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/consultation.db".to_string()),
            ),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let server = ServerConfig {
            bind_addr: env::var("SERVER_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8787".to_string()),
        };

        let realtime = RealtimeConfig {
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECS", 30),
            reconnect_base_delay_ms: env_parse("RECONNECT_BASE_DELAY_MS", 1000),
            reconnect_max_attempts: env_parse("RECONNECT_MAX_ATTEMPTS", 5),
        };

        let gate = GateConfig {
            max_clarification_attempts: env_parse("GATE_MAX_CLARIFICATION_ATTEMPTS", 10),
        };

        let session = SessionConfig {
            queue_capacity: env_parse("SESSION_QUEUE_CAPACITY", 64),
        };

        let request = RequestConfig {
            timeout_ms: env_parse("REQUEST_TIMEOUT_MS", 30000),
            max_retries: env_parse("MAX_RETRIES", 3),
            retry_delay_ms: env_parse("RETRY_DELAY_MS", 1000),
        };

        let sources = SourceConfig {
            knowledge_base_url: env_url("SOURCE_KNOWLEDGE_BASE_URL"),
            vector_search_url: env_url("SOURCE_VECTOR_SEARCH_URL"),
            architecture_rules_url: env_url("SOURCE_ARCHITECTURE_RULES_URL"),
            cost_model_url: env_url("SOURCE_COST_MODEL_URL"),
        };

        let config = Config {
            database,
            logging,
            server,
            realtime,
            gate,
            session,
            request,
            sources,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.realtime.heartbeat_interval_secs == 0 {
            return Err(AppError::Config {
                message: "HEARTBEAT_INTERVAL_SECS must be greater than 0".to_string(),
            });
        }
        if self.realtime.reconnect_max_attempts == 0 {
            return Err(AppError::Config {
                message: "RECONNECT_MAX_ATTEMPTS must be greater than 0".to_string(),
            });
        }
        if self.gate.max_clarification_attempts == 0 {
            return Err(AppError::Config {
                message: "GATE_MAX_CLARIFICATION_ATTEMPTS must be greater than 0".to_string(),
            });
        }
        if self.session.queue_capacity == 0 {
            return Err(AppError::Config {
                message: "SESSION_QUEUE_CAPACITY must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: PathBuf::from("./data/consultation.db"),
                max_connections: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            server: ServerConfig {
                bind_addr: "127.0.0.1:8787".to_string(),
            },
            realtime: RealtimeConfig::default(),
            gate: GateConfig::default(),
            session: SessionConfig::default(),
            request: RequestConfig::default(),
            sources: SourceConfig::default(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            reconnect_base_delay_ms: 1000,
            reconnect_max_attempts: 5,
        }
    }
}

impl RealtimeConfig {
    /// Get heartbeat interval as Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence longer than this marks the connection dead (2x heartbeat).
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval() * 2
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_clarification_attempts: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}
