//! YOLO-family ONNX detector run with tract.

use super::{DetectionEngine, RawDetection};
use crate::config::ModelConfig;
use anyhow::{anyhow, bail, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use std::cmp::Ordering;
use std::path::Path;
use tract_onnx::prelude::*;
use tracing::{debug, info};

/// ONNX detector producing YOLOv8-style `[1, 4 + classes, anchors]` output.
///
/// The input image is stretched to a square `input_size` and normalized to
/// [0, 1] NCHW. Boxes are scaled back to the source image.
pub struct YoloEngine {
    model: TypedRunnableModel<TypedModel>,
    labels: Vec<String>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl YoloEngine {
    /// Load weights and the label table from disk and prepare the plan
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let labels = load_labels(&config.labels_path)?;
        let size = config.input_size as usize;
        let weights = &config.weights_path;

        let model = tract_onnx::onnx()
            .model_for_path(weights)
            .with_context(|| format!("failed to load ONNX model from {}", weights.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        info!(
            weights = %weights.display(),
            classes = labels.len(),
            input_size = config.input_size,
            "YOLO model loaded"
        );

        Ok(Self {
            model,
            labels,
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let size = self.input_size;
        let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
        let size = size as usize;

        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }
}

impl DetectionEngine for YoloEngine {
    fn name(&self) -> &str {
        "yolo-tract"
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            bail!("image has zero size");
        }

        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;

        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;

        let shape = view.shape().to_vec();
        let frame = Frame {
            scale_x: width as f32 / self.input_size as f32,
            scale_y: height as f32 / self.input_size as f32,
            width: width as f32,
            height: height as f32,
        };

        let predictions = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .with_context(|| format!("unexpected output shape {:?}", shape))?;

        let candidates = decode_predictions(predictions, self.confidence_threshold, &frame)?;
        let kept = non_max_suppression(candidates, self.iou_threshold);

        debug!(detections = kept.len(), "YOLO detections decoded");

        Ok(kept)
    }
}

/// Read a label table: one class name per line, blank lines ignored
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read label table {}", path.display()))?;
    let labels: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();

    if labels.is_empty() {
        bail!("label table {} is empty", path.display());
    }

    Ok(labels)
}

/// Source frame geometry used to map model-space boxes back to pixels
#[derive(Debug, Clone, Copy)]
struct Frame {
    scale_x: f32,
    scale_y: f32,
    width: f32,
    height: f32,
}

/// Decode `[1, 4 + classes, anchors]` (or its transpose) predictions.
///
/// Each anchor contributes at most one candidate: its best-scoring class,
/// if that score reaches `threshold`.
fn decode_predictions(
    predictions: tract_ndarray::ArrayView3<'_, f32>,
    threshold: f32,
    frame: &Frame,
) -> Result<Vec<RawDetection>> {
    let (batch, rows, cols) = predictions.dim();
    if batch != 1 {
        bail!("expected batch of 1, got {}", batch);
    }

    // anchors usually outnumber attributes; use that to detect layout
    let predictions = if rows <= cols {
        predictions.index_axis_move(tract_ndarray::Axis(0), 0)
    } else {
        predictions
            .index_axis_move(tract_ndarray::Axis(0), 0)
            .reversed_axes()
    };

    let (attributes, anchors) = predictions.dim();
    if attributes <= 4 {
        bail!("output has {} attributes, expected box + class scores", attributes);
    }

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let column = predictions.column(anchor);
        let best = column
            .iter()
            .skip(4)
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal));

        let Some((class_index, &score)) = best else {
            continue;
        };
        if !score.is_finite() || score < threshold {
            continue;
        }

        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        let clamp = |v: f32, max: f32| v.max(0.0).min(max);
        let bbox = [
            clamp((cx - w / 2.0) * frame.scale_x, frame.width),
            clamp((cy - h / 2.0) * frame.scale_y, frame.height),
            clamp((cx + w / 2.0) * frame.scale_x, frame.width),
            clamp((cy + h / 2.0) * frame.scale_y, frame.height),
        ];

        candidates.push(RawDetection {
            class_index,
            confidence: score,
            bbox,
        });
    }

    Ok(candidates)
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy per-class NMS. Output is ordered by descending confidence.
fn non_max_suppression(mut candidates: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_index == candidate.class_index && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept
}
