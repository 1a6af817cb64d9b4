use chrono::FixedOffset;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the detection service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Staging and artifact directories
    #[serde(default)]
    pub storage: StorageConfig,
    /// Detection model configuration
    #[serde(default)]
    pub model: ModelConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Response/log formatting
    #[serde(default)]
    pub detection: DetectionConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Filesystem locations used by the pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for staged uploads
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Directory for published artifacts, served under /log
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

/// Detection model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// ONNX weights file
    #[serde(default = "default_weights_path")]
    pub weights_path: PathBuf,
    /// Label table, one class name per line in class-index order
    #[serde(default = "default_labels_path")]
    pub labels_path: PathBuf,
    /// Square model input size in pixels
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// Minimum class score kept after decoding
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// IoU above which overlapping boxes of the same class are suppressed
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    /// Deadline for a single inference call
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,
    /// Load the model at startup instead of on the first request
    #[serde(default = "default_true")]
    pub preload: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Detection result formatting
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Offset from UTC used for the response `date` field
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// Default value functions
fn default_service_name() -> String {
    "fire-detection-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("log")
}

fn default_weights_path() -> PathBuf {
    PathBuf::from("assets/best.onnx")
}

fn default_labels_path() -> PathBuf {
    PathBuf::from("assets/labels.txt")
}

fn default_input_size() -> u32 {
    640
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_database_url() -> String {
    "sqlite://sql_app.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_utc_offset_minutes() -> i32 {
    9 * 60 // Asia/Seoul
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/detection").required(false))
            .add_source(config::File::with_name("/etc/fire-detection/detection").required(false))
            // Override with environment variables
            // DETECTION__MODEL__WEIGHTS_PATH -> model.weights_path
            .add_source(
                config::Environment::with_prefix("DETECTION")
                    .separator("__")
                    .try_parsing(true),
            )
            // A bare DATABASE_URL wins over everything else
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.model.weights_path.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "model.weights_path".to_string(),
            ));
        }

        if self.model.input_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "model.input_size".to_string(),
                message: "Input size must be greater than 0".to_string(),
            });
        }

        for (field, value) in [
            ("model.confidence_threshold", self.model.confidence_threshold),
            ("model.iou_threshold", self.model.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: format!("{} is outside [0, 1]", value),
                });
            }
        }

        if self.model.inference_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "model.inference_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.api.max_upload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_upload_bytes".to_string(),
                message: "Upload limit must be greater than 0".to_string(),
            });
        }

        self.detection.timezone()?;

        Ok(())
    }

    /// Get inference deadline as Duration
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.model.inference_timeout_secs)
    }
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl DetectionConfig {
    /// Fixed offset used to render detection timestamps
    pub fn timezone(&self) -> Result<FixedOffset, ConfigValidationError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            ConfigValidationError::InvalidValue {
                field: "detection.utc_offset_minutes".to_string(),
                message: format!("{} is not a valid UTC offset", self.utc_offset_minutes),
            }
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights_path: default_weights_path(),
            labels_path: default_labels_path(),
            input_size: default_input_size(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            inference_timeout_secs: default_inference_timeout_secs(),
            preload: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}
