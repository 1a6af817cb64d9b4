use crate::config::DatabaseConfig;
use crate::detection::{DetectionOutcome, DetectionRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Persisted detection log row
#[derive(Debug, Clone, FromRow)]
pub struct DetectionLog {
    /// Generated row ID
    pub id: i64,
    /// Original upload name (fire outcomes only)
    pub file_name: Option<String>,
    /// Artifact reference (fire outcomes only)
    pub result_image: Option<String>,
    /// Detections as returned to the client
    pub detections: Json<Vec<DetectionRecord>>,
    /// Client-facing message
    pub message: String,
    /// Fire flag
    pub has_fire: bool,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Detection log in API responses
#[derive(Debug, Clone, Serialize)]
pub struct DetectionLogResponse {
    pub id: i64,
    pub file_name: Option<String>,
    pub result_image: Option<String>,
    pub detections: Vec<DetectionRecord>,
    pub message: String,
    pub has_fire: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DetectionLog> for DetectionLogResponse {
    fn from(log: DetectionLog) -> Self {
        Self {
            id: log.id,
            file_name: log.file_name,
            result_image: log.result_image,
            detections: log.detections.0,
            message: log.message,
            has_fire: log.has_fire,
            created_at: log.created_at,
        }
    }
}

/// Query parameters for log search
#[derive(Debug, Clone)]
pub struct LogQuery {
    /// Filter by fire flag
    pub has_fire: Option<bool>,
    /// Maximum number of results
    pub limit: i64,
    /// Offset for pagination
    pub offset: i64,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            has_fire: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Sink for finished detection outcomes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DetectionLogWriter: Send + Sync {
    /// Persist one outcome, returning the generated row ID
    async fn write(&self, outcome: &DetectionOutcome) -> Result<i64>;
}

/// SQLite-backed detection log store
pub struct LogStore {
    pool: SqlitePool,
}

impl LogStore {
    /// Create a new log store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("Invalid database URL {}", config.url))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite")?;

        info!("Connected to detection log database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a detection log row
    #[instrument(skip(self, outcome), fields(kind = outcome.kind().as_str()))]
    pub async fn insert(&self, outcome: &DetectionOutcome) -> Result<i64> {
        // scoped to this call; returned to the pool on every path
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;

        let result = sqlx::query(
            r#"
            INSERT INTO detection_logs (
                file_name, result_image, detections,
                message, has_fire, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(outcome.file_name())
        .bind(outcome.artifact())
        .bind(Json(outcome.detections()))
        .bind(outcome.message())
        .bind(outcome.has_fire())
        .bind(outcome.timestamp().with_timezone(&Utc))
        .execute(&mut *conn)
        .await
        .context("Failed to insert detection log")?;

        let id = result.last_insert_rowid();

        debug!(
            log_id = id,
            has_fire = outcome.has_fire(),
            detection_count = outcome.detections().len(),
            "Detection log written"
        );

        metrics::counter!("detection.logs.written").increment(1);

        Ok(id)
    }

    /// Get a detection log by ID
    pub async fn get(&self, id: i64) -> Result<Option<DetectionLog>> {
        let log = sqlx::query_as::<_, DetectionLog>(
            r#"
            SELECT id, file_name, result_image, detections,
                   message, has_fire, created_at
            FROM detection_logs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query detection log")?;

        Ok(log)
    }

    /// List detection logs, newest first
    #[instrument(skip(self))]
    pub async fn list(&self, query: &LogQuery) -> Result<Vec<DetectionLog>> {
        let logs = sqlx::query_as::<_, DetectionLog>(
            r#"
            SELECT id, file_name, result_image, detections,
                   message, has_fire, created_at
            FROM detection_logs
            WHERE (? IS NULL OR has_fire = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(query.has_fire)
        .bind(query.has_fire)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query detection logs")?;

        Ok(logs)
    }

    /// Count detection logs, optionally by fire flag
    pub async fn count(&self, has_fire: Option<bool>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM detection_logs
            WHERE (? IS NULL OR has_fire = ?)
            "#,
        )
        .bind(has_fire)
        .bind(has_fire)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count detection logs")?;

        Ok(count.0)
    }

    /// Check database connectivity
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DetectionLogWriter for LogStore {
    async fn write(&self, outcome: &DetectionOutcome) -> Result<i64> {
        self.insert(outcome).await
    }
}
