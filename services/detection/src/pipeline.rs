//! The detection-request pipeline.
//!
//! ```text
//! Received -> Validated -> Staged -> Inferred -> Classified -> [Published] -> Logged -> Responded
//!     \___________\___________\__________\___________\______________\__________> Failed(stage, reason)
//! ```
//!
//! Stages run strictly in order; the first failure short-circuits the rest.
//! The staged upload is removed on every exit path when its guard drops.

use crate::artifact_store::ArtifactStore;
use crate::detection::{classify, Classification, DetectionOutcome};
use crate::error::{DetectionError, PipelineFailure, Stage};
use crate::inference::InferenceAdapter;
use crate::log_store::DetectionLogWriter;
use crate::staging::StagingStore;
use crate::validator::validate_file_name;
use bytes::Bytes;
use chrono::{FixedOffset, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// One uploaded file
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub data: Bytes,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
        }
    }
}

/// Pipeline progress, traced on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Validated,
    Staged,
    Inferred,
    Classified,
    Published,
    Logged,
    Responded,
    Failed(Stage),
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Received => "received",
            PipelineState::Validated => "validated",
            PipelineState::Staged => "staged",
            PipelineState::Inferred => "inferred",
            PipelineState::Classified => "classified",
            PipelineState::Published => "published",
            PipelineState::Logged => "logged",
            PipelineState::Responded => "responded",
            PipelineState::Failed(stage) => return write!(f, "failed({})", stage),
        };
        f.write_str(name)
    }
}

struct Progress {
    state: PipelineState,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: PipelineState::Received,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!(from = %self.state, to = %next, "Pipeline transition");
        self.state = next;
    }

    fn fail(&mut self, stage: Stage, error: DetectionError) -> PipelineFailure {
        self.advance(PipelineState::Failed(stage));
        PipelineFailure::new(stage, error)
    }
}

/// Orchestrates one detection request end to end
pub struct DetectionPipeline {
    staging: StagingStore,
    inference: InferenceAdapter,
    artifacts: ArtifactStore,
    log_writer: Arc<dyn DetectionLogWriter>,
    timezone: FixedOffset,
}

impl DetectionPipeline {
    pub fn new(
        staging: StagingStore,
        inference: InferenceAdapter,
        artifacts: ArtifactStore,
        log_writer: Arc<dyn DetectionLogWriter>,
        timezone: FixedOffset,
    ) -> Self {
        Self {
            staging,
            inference,
            artifacts,
            log_writer,
            timezone,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run the pipeline for one upload
    #[instrument(skip(self, upload), fields(file_name = %upload.file_name, size_bytes = upload.data.len()))]
    pub async fn run(&self, upload: Upload) -> Result<DetectionOutcome, PipelineFailure> {
        metrics::counter!("detection.requests").increment(1);

        let mut progress = Progress::new();
        let result = self.execute(&upload, &mut progress).await;

        match &result {
            Ok(outcome) => {
                progress.advance(PipelineState::Responded);
                metrics::counter!("detection.outcomes", "kind" => outcome.kind().as_str())
                    .increment(1);
                info!(
                    kind = outcome.kind().as_str(),
                    detections = outcome.detections().len(),
                    result_image = outcome.artifact().unwrap_or_default(),
                    "Detection completed"
                );
            }
            Err(failure) => {
                metrics::counter!("detection.failures", "stage" => failure.stage.as_str())
                    .increment(1);
                if failure.error.is_client_error() {
                    info!(stage = %failure.stage, error = %failure.error, "Upload rejected");
                } else {
                    error!(stage = %failure.stage, error = %failure.error, "Detection failed");
                }
            }
        }

        result
    }

    async fn execute(
        &self,
        upload: &Upload,
        progress: &mut Progress,
    ) -> Result<DetectionOutcome, PipelineFailure> {
        let extension = match validate_file_name(&upload.file_name) {
            Ok(extension) => extension,
            Err(e) => return Err(progress.fail(Stage::Validate, e)),
        };
        progress.advance(PipelineState::Validated);

        // dropped at the end of this scope, on success and failure alike
        let staged = match self.staging.stage(extension, &upload.data).await {
            Ok(staged) => staged,
            Err(e) => return Err(progress.fail(Stage::Stage, e)),
        };
        progress.advance(PipelineState::Staged);

        let inference = match self.inference.infer(staged.path()).await {
            Ok(inference) => inference,
            Err(e) => return Err(progress.fail(Stage::Infer, e)),
        };
        progress.advance(PipelineState::Inferred);

        let classification = classify(inference.detections);
        progress.advance(PipelineState::Classified);

        let timestamp = Utc::now().with_timezone(&self.timezone);
        let outcome = match classification {
            Classification::Fire(detections) => {
                let artifact = match self.artifacts.publish(inference.annotated, staged.name()).await {
                    Ok(artifact) => artifact,
                    Err(e) => return Err(progress.fail(Stage::Publish, e)),
                };
                progress.advance(PipelineState::Published);
                DetectionOutcome::fire(&upload.file_name, detections, artifact, timestamp)
            }
            Classification::Safe(detections) => {
                DetectionOutcome::safe(&upload.file_name, detections, timestamp)
            }
        };

        if let Err(e) = self.log_writer.write(&outcome).await {
            // no log row means no artifact either
            if let Some(artifact) = outcome.artifact() {
                self.artifacts.discard(artifact).await;
            }
            return Err(progress.fail(
                Stage::Log,
                DetectionError::PersistenceFailed(format!("{:#}", e)),
            ));
        }
        progress.advance(PipelineState::Logged);

        Ok(outcome)
    }
}
