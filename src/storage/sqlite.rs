use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{SessionRecord, Storage};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::gate::GateStatus;
use crate::history::{ConfidenceHistoryPoint, WorkflowPhase};
use crate::scoring::ConfidenceScore;

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        Self::connect(options, config.max_connections).await
    }

    /// In-memory database. A single connection keeps every query on the
    /// same database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_session(&self, session: &SessionRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, phase, status, last_score, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.phase.as_str())
        .bind(session.status.as_str())
        .bind(encode_score(session.last_score.as_ref())?)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(session_id = %session.id, "Session created");
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, phase, status, last_score, created_at, updated_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRecord::try_from).transpose()
    }

    async fn update_session(&self, session: &SessionRecord) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET phase = ?, status = ?, last_score = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(session.phase.as_str())
        .bind(session.status.as_str())
        .bind(encode_score(session.last_score.as_ref())?)
        .bind(session.updated_at.to_rfc3339())
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound {
                session_id: session.id.clone(),
            });
        }

        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM confidence_history WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(session_id = %id, "Session deleted");
        Ok(())
    }

    async fn append_history_point(
        &self,
        session_id: &str,
        point: &ConfidenceHistoryPoint,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO confidence_history (session_id, timestamp, confidence, phase)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(point.timestamp.to_rfc3339())
        .bind(point.confidence)
        .bind(point.phase.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_history(&self, session_id: &str) -> StorageResult<Vec<ConfidenceHistoryPoint>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT timestamp, confidence, phase
            FROM confidence_history
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(ConfidenceHistoryPoint::try_from)
            .collect()
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    phase: String,
    status: String,
    last_score: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            phase: parse_phase(&row.phase)?,
            status: GateStatus::from_str(&row.status)
                .map_err(|message| StorageError::Query { message })?,
            last_score: row.last_score.as_deref().map(decode_score).transpose()?,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            id: row.id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    timestamp: String,
    confidence: f64,
    phase: String,
}

impl TryFrom<HistoryRow> for ConfidenceHistoryPoint {
    type Error = StorageError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: parse_timestamp(&row.timestamp),
            confidence: row.confidence,
            phase: parse_phase(&row.phase)?,
        })
    }
}

fn parse_phase(value: &str) -> StorageResult<WorkflowPhase> {
    WorkflowPhase::from_str(value).map_err(|message| StorageError::Query { message })
}

fn encode_score(score: Option<&ConfidenceScore>) -> StorageResult<Option<String>> {
    score
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::Query {
            message: format!("Failed to encode score: {}", e),
        })
}

fn decode_score(value: &str) -> StorageResult<ConfidenceScore> {
    serde_json::from_str(value).map_err(|e| StorageError::Query {
        message: format!("Stored score is corrupt: {}", e),
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
