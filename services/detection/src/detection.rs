//! Detection records, fire/safe classification and the outcome of one request.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// The only class label the service interprets
pub const FIRE_LABEL: &str = "fire";

/// Decimal places kept for confidence and box coordinates
pub const PRECISION_DECIMALS: i32 = 4;

/// Response format of the `date` field
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One detected region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Class name from the engine's label table
    pub class_name: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
    /// Bounding box [x1, y1, x2, y2] in source pixels
    pub bbox: [f64; 4],
}

impl DetectionRecord {
    /// Build a normalized record: confidence clamped to [0, 1], corners
    /// ordered so x1 <= x2 and y1 <= y2, values rounded.
    pub fn new(class_name: impl Into<String>, confidence: f64, bbox: [f64; 4]) -> Self {
        let [ax, ay, bx, by] = bbox;
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };

        Self {
            class_name: class_name.into(),
            confidence: round(confidence),
            bbox: [
                round(ax.min(bx)),
                round(ay.min(by)),
                round(ax.max(bx)),
                round(ay.max(by)),
            ],
        }
    }

    pub fn is_fire(&self) -> bool {
        self.class_name == FIRE_LABEL
    }
}

fn round(value: f64) -> f64 {
    let scale = 10f64.powi(PRECISION_DECIMALS);
    (value * scale).round() / scale
}

/// Binary verdict derived from detections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Fire,
    Safe,
}

impl OutcomeKind {
    /// Client-facing message for this verdict
    pub fn message(&self) -> &'static str {
        match self {
            OutcomeKind::Fire => "fire detected",
            OutcomeKind::Safe => "safe",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Fire => "fire",
            OutcomeKind::Safe => "safe",
        }
    }
}

/// Classification result. `Fire` is only produced when at least one
/// detection carries the fire label.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Fire(Vec<DetectionRecord>),
    Safe(Vec<DetectionRecord>),
}

/// Classify a detection sequence. Pure, no failure mode.
pub fn classify(detections: Vec<DetectionRecord>) -> Classification {
    if detections.iter().any(DetectionRecord::is_fire) {
        Classification::Fire(detections)
    } else {
        Classification::Safe(detections)
    }
}

impl Classification {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Classification::Fire(_) => OutcomeKind::Fire,
            Classification::Safe(_) => OutcomeKind::Safe,
        }
    }

    pub fn detections(&self) -> &[DetectionRecord] {
        match self {
            Classification::Fire(d) | Classification::Safe(d) => d,
        }
    }
}

/// Verdict with its shape-specific data
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Fire found; the annotated image was published under `artifact`
    Fire { artifact: String },
    Safe,
}

/// Final result of one detection request
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutcome {
    file_name: String,
    detections: Vec<DetectionRecord>,
    verdict: Verdict,
    timestamp: DateTime<FixedOffset>,
}

impl DetectionOutcome {
    /// Outcome for a fire classification whose artifact has been published
    pub(crate) fn fire(
        file_name: impl Into<String>,
        detections: Vec<DetectionRecord>,
        artifact: impl Into<String>,
        timestamp: DateTime<FixedOffset>,
    ) -> Self {
        debug_assert!(detections.iter().any(DetectionRecord::is_fire));
        Self {
            file_name: file_name.into(),
            detections,
            verdict: Verdict::Fire {
                artifact: artifact.into(),
            },
            timestamp,
        }
    }

    /// Outcome for a safe classification
    pub(crate) fn safe(
        file_name: impl Into<String>,
        detections: Vec<DetectionRecord>,
        timestamp: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            detections,
            verdict: Verdict::Safe,
            timestamp,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self.verdict {
            Verdict::Fire { .. } => OutcomeKind::Fire,
            Verdict::Safe => OutcomeKind::Safe,
        }
    }

    pub fn has_fire(&self) -> bool {
        self.kind() == OutcomeKind::Fire
    }

    pub fn message(&self) -> &'static str {
        self.kind().message()
    }

    /// Original upload name, whatever the verdict
    pub fn original_file_name(&self) -> &str {
        &self.file_name
    }

    /// Upload name as reported to clients and logs: only set for fire
    pub fn file_name(&self) -> Option<&str> {
        match self.verdict {
            Verdict::Fire { .. } => Some(&self.file_name),
            Verdict::Safe => None,
        }
    }

    pub fn artifact(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Fire { artifact } => Some(artifact),
            Verdict::Safe => None,
        }
    }

    pub fn detections(&self) -> &[DetectionRecord] {
        &self.detections
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    pub fn formatted_date(&self) -> String {
        self.timestamp.format(DATE_FORMAT).to_string()
    }
}

/// JSON body of a successful `POST /predict_fire`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictFireResponse {
    pub message: String,
    pub file_name: Option<String>,
    pub detections: Vec<DetectionRecord>,
    pub result_image: Option<String>,
    pub date: String,
}

impl From<&DetectionOutcome> for PredictFireResponse {
    fn from(outcome: &DetectionOutcome) -> Self {
        Self {
            message: outcome.message().to_string(),
            file_name: outcome.file_name().map(String::from),
            detections: outcome.detections.clone(),
            result_image: outcome.artifact().map(String::from),
            date: outcome.formatted_date(),
        }
    }
}
