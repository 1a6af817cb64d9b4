//! Fire Detection Service
//!
//! Single-image fire detection over HTTP. A client uploads one image; the
//! service stages it on disk, runs an object-detection model over it, decides
//! whether any detection is fire, publishes an annotated copy when it is, and
//! records every completed request in SQLite.
//!
//! ## Features
//!
//! - **Strict Upload Validation**: only `.jpg`, `.jpeg` and `.png` names are
//!   accepted, case-insensitively
//! - **Collision-Free Staging**: every upload gets a fresh UUID name and is
//!   removed again on every exit path
//! - **Bounded Inference**: the ONNX model runs on the blocking pool under a
//!   configurable deadline
//! - **Annotated Artifacts**: fire results are drawn onto the image and served
//!   under `/log`
//! - **Queryable Detection Log**: SQLite-backed history of every outcome
//!
//! ## Architecture
//!
//! ```text
//!  POST /predict_fire
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Validator    │──▶│ Staging      │──▶│ Inference    │──▶│ Classifier   │
//! │ (extension)  │   │ temp/{uuid}  │   │ (tract ONNX) │   │ fire / safe  │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//!                                                                 │
//!                           ┌─────────────────────────────────────┤
//!                           │ fire                                │
//!                           ▼                                     ▼
//!                    ┌──────────────┐                      ┌──────────────┐
//!                    │ Artifact     │─────────────────────▶│ Log Store    │
//!                    │ Store log/   │                      │ (SQLite)     │
//!                    └──────────────┘                      └──────────────┘
//!                           │                                     │
//!                           ▼                                     ▼
//!                     GET /log/{name}                  GET /detection_logs
//! ```

pub mod api;
pub mod artifact_store;
pub mod config;
pub mod detection;
pub mod error;
pub mod inference;
pub mod log_store;
pub mod pipeline;
pub mod staging;
pub mod validator;

pub use api::{create_router, start_api_server, AppState};
pub use artifact_store::ArtifactStore;
pub use config::Config;
pub use detection::{DetectionOutcome, DetectionRecord, OutcomeKind, PredictFireResponse};
pub use error::{DetectionError, PipelineFailure, Stage};
pub use inference::{DetectionEngine, InferenceAdapter, YoloEngine};
pub use log_store::{DetectionLog, DetectionLogWriter, LogQuery, LogStore};
pub use pipeline::{DetectionPipeline, Upload};
pub use staging::{StagedFile, StagingStore};
