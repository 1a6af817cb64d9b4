//! Failure taxonomy for the detection pipeline.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the individual pipeline stages.
///
/// Payload strings carry the operator-facing cause. They are logged but never
/// sent to the client; see [`PipelineFailure::client_detail`].
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("unsupported file format: {0:?}")]
    UnsupportedFormat(String),

    #[error("staging failed: {0}")]
    StagingFailed(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("inference exceeded deadline of {0:?}")]
    InferenceTimeout(Duration),

    #[error("artifact write failed: {0}")]
    ArtifactWriteFailed(String),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
}

impl DetectionError {
    /// True for errors caused by the client's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::UnsupportedFormat(_))
    }
}

/// Pipeline stage at which an invocation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Stage,
    Infer,
    Publish,
    Log,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Stage => "stage",
            Stage::Infer => "infer",
            Stage::Publish => "publish",
            Stage::Log => "log",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of one pipeline invocation.
#[derive(Debug, Error)]
#[error("pipeline failed at {stage}: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub error: DetectionError,
}

impl PipelineFailure {
    pub fn new(stage: Stage, error: DetectionError) -> Self {
        Self { stage, error }
    }

    /// Message safe to return to the client.
    pub fn client_detail(&self) -> &'static str {
        match self.error {
            DetectionError::UnsupportedFormat(_) => {
                "unsupported file format. only jpg, jpeg or png are allowed."
            }
            DetectionError::StagingFailed(_) => "failed to save file.",
            _ => "failed to process image.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_detail_hides_cause() {
        let failure = PipelineFailure::new(
            Stage::Log,
            DetectionError::PersistenceFailed("/var/lib/db locked".to_string()),
        );
        assert_eq!(failure.client_detail(), "failed to process image.");
        assert!(failure.to_string().contains("/var/lib/db locked"));
    }

    #[test]
    fn test_only_unsupported_format_is_client_error() {
        assert!(DetectionError::UnsupportedFormat("a.pdf".into()).is_client_error());
        assert!(!DetectionError::InferenceTimeout(Duration::from_secs(1)).is_client_error());
        assert!(!DetectionError::StagingFailed("disk full".into()).is_client_error());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Validate.to_string(), "validate");
        assert_eq!(Stage::Publish.as_str(), "publish");
    }
}
