//! Inference adapter around a black-box object detector.
//!
//! The adapter owns the process-wide engine handle, runs the blocking
//! detection call off the async runtime under a deadline, and turns the
//! engine's raw output into [`DetectionRecord`]s plus an annotated copy of
//! the source image.

pub mod yolo;

use crate::detection::DetectionRecord;
use crate::error::DetectionError;
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument};

pub use yolo::YoloEngine;

/// One region as reported by the engine, before label lookup
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    /// Index into the engine's label table
    pub class_index: usize,
    /// Class score
    pub confidence: f32,
    /// [x1, y1, x2, y2] in source image pixels
    pub bbox: [f32; 4],
}

/// Object detection engine.
///
/// `detect` is a blocking, potentially long-running call. Implementations
/// are shared across requests and must not mutate themselves.
pub trait DetectionEngine: Send + Sync {
    /// Engine identifier for logs
    fn name(&self) -> &str;

    /// Class names indexed by `RawDetection::class_index`
    fn labels(&self) -> &[String];

    /// Run detection on a decoded RGB image
    fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<RawDetection>>;
}

/// Builds the engine. Called at most once per successful construction.
pub type EngineLoader = Arc<dyn Fn() -> anyhow::Result<Arc<dyn DetectionEngine>> + Send + Sync>;

/// Output of a single inference call
#[derive(Debug, Clone)]
pub struct Inference {
    /// Detections in engine order
    pub detections: Vec<DetectionRecord>,
    /// Source image with detection boxes drawn, same dimensions
    pub annotated: RgbImage,
}

const FIRE_COLOR: Rgb<u8> = Rgb([255, 32, 32]);
const OTHER_COLOR: Rgb<u8> = Rgb([32, 160, 255]);
const BOX_THICKNESS: u32 = 3;

/// Adapter between the pipeline and a [`DetectionEngine`]
pub struct InferenceAdapter {
    loader: EngineLoader,
    engine: OnceCell<Arc<dyn DetectionEngine>>,
    timeout: Duration,
}

impl InferenceAdapter {
    /// Create an adapter that constructs its engine on first use
    pub fn new(loader: EngineLoader, timeout: Duration) -> Self {
        Self {
            loader,
            engine: OnceCell::new(),
            timeout,
        }
    }

    /// Create an adapter around an already constructed engine
    pub fn with_engine(engine: Arc<dyn DetectionEngine>, timeout: Duration) -> Self {
        let loader_engine = engine.clone();
        Self {
            loader: Arc::new(move || Ok(loader_engine.clone())),
            engine: OnceCell::new_with(Some(engine)),
            timeout,
        }
    }

    /// Get the shared engine, constructing it if needed.
    ///
    /// A failed construction is not cached; the next call retries.
    pub async fn engine(&self) -> Result<Arc<dyn DetectionEngine>, DetectionError> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                let loader = self.loader.clone();
                let engine = tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|e| {
                        DetectionError::InferenceFailed(format!("engine loader panicked: {}", e))
                    })?
                    .map_err(|e| {
                        error!(error = %format!("{:#}", e), "Failed to load detection engine");
                        DetectionError::InferenceFailed(format!("failed to load engine: {:#}", e))
                    })?;

                info!(
                    engine = engine.name(),
                    labels = engine.labels().len(),
                    "Detection engine loaded"
                );
                Ok::<_, DetectionError>(engine)
            })
            .await?;

        Ok(engine.clone())
    }

    /// Run detection on the image at `image_path`.
    ///
    /// The deadline covers the blocking call only. A timed-out call keeps
    /// running on the blocking pool until the engine returns.
    #[instrument(skip(self), fields(path = %image_path.display()))]
    pub async fn infer(&self, image_path: &Path) -> Result<Inference, DetectionError> {
        let engine = self.engine().await?;
        let path = image_path.to_path_buf();
        let started = Instant::now();

        let task = tokio::task::spawn_blocking(move || run_inference(engine.as_ref(), &path));

        let result = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => return Err(DetectionError::InferenceTimeout(self.timeout)),
            Ok(Err(e)) => {
                return Err(DetectionError::InferenceFailed(format!(
                    "inference task panicked: {}",
                    e
                )))
            }
            Ok(Ok(result)) => result,
        };

        let elapsed = started.elapsed();
        metrics::histogram!("detection.inference.duration_seconds").record(elapsed.as_secs_f64());

        if let Ok(inference) = &result {
            debug!(
                detections = inference.detections.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Inference completed"
            );
        }

        result
    }
}

fn run_inference(engine: &dyn DetectionEngine, path: &Path) -> Result<Inference, DetectionError> {
    // content decides the decoder, not the upload's extension
    let image = image::ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| {
            DetectionError::InferenceFailed(format!("failed to read {}: {}", path.display(), e))
        })?
        .decode()
        .map_err(|e| {
            DetectionError::InferenceFailed(format!("failed to decode {}: {}", path.display(), e))
        })?
        .to_rgb8();

    let raw = engine
        .detect(&image)
        .map_err(|e| DetectionError::InferenceFailed(format!("{:#}", e)))?;

    let labels = engine.labels();
    let detections = raw
        .iter()
        .map(|r| to_record(r, labels))
        .collect::<Result<Vec<_>, _>>()?;

    let annotated = annotate(&image, &detections);

    Ok(Inference {
        detections,
        annotated,
    })
}

/// Map a raw detection to a record using the engine's label table
fn to_record(raw: &RawDetection, labels: &[String]) -> Result<DetectionRecord, DetectionError> {
    let class_name = labels.get(raw.class_index).ok_or_else(|| {
        DetectionError::InferenceFailed(format!(
            "class index {} outside label table of {} entries",
            raw.class_index,
            labels.len()
        ))
    })?;

    Ok(DetectionRecord::new(
        class_name.clone(),
        raw.confidence as f64,
        raw.bbox.map(f64::from),
    ))
}

/// Draw each detection box onto a copy of `image`
pub fn annotate(image: &RgbImage, detections: &[DetectionRecord]) -> RgbImage {
    let mut annotated = image.clone();
    for detection in detections {
        let color = if detection.is_fire() {
            FIRE_COLOR
        } else {
            OTHER_COLOR
        };
        draw_rect(&mut annotated, detection.bbox, color, BOX_THICKNESS);
    }
    annotated
}

fn draw_rect(img: &mut RgbImage, bbox: [f64; 4], color: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp = |v: f64, max: u32| -> u32 { v.max(0.0).min((max - 1) as f64) as u32 };
    let x0 = clamp(bbox[0], w);
    let y0 = clamp(bbox[1], h);
    let x1 = clamp(bbox[2], w);
    let y1 = clamp(bbox[3], h);

    for t in 0..thickness {
        let xx0 = x0 + t;
        let yy0 = y0 + t;
        let xx1 = x1.saturating_sub(t);
        let yy1 = y1.saturating_sub(t);
        if xx0 > xx1 || yy0 > yy1 {
            break;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine returning a fixed detection list
    pub(crate) struct StubEngine {
        pub labels: Vec<String>,
        pub detections: Vec<RawDetection>,
        pub delay: Option<Duration>,
    }

    impl StubEngine {
        pub(crate) fn new(labels: &[&str], detections: Vec<RawDetection>) -> Self {
            Self {
                labels: labels.iter().map(|s| s.to_string()).collect(),
                detections,
                delay: None,
            }
        }
    }

    impl DetectionEngine for StubEngine {
        fn name(&self) -> &str {
            "stub"
        }

        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn detect(&self, _image: &RgbImage) -> anyhow::Result<Vec<RawDetection>> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Ok(self.detections.clone())
        }
    }

    pub(crate) fn raw(class_index: usize, confidence: f32, bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            class_index,
            confidence,
            bbox,
        }
    }

    pub(crate) fn write_test_image(path: &Path, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, Rgb([10, 10, 10]))
            .save(path)
            .unwrap();
    }

    #[tokio::test]
    async fn test_infer_maps_labels_and_keeps_engine_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame.png");
        write_test_image(&path, 64, 48);

        let engine = StubEngine::new(
            &["smoke", "fire"],
            vec![
                raw(0, 0.40, [1.0, 1.0, 10.0, 10.0]),
                raw(1, 0.91, [20.0, 30.0, 5.0, 8.0]),
            ],
        );
        let adapter = InferenceAdapter::with_engine(Arc::new(engine), Duration::from_secs(5));

        let inference = adapter.infer(&path).await.unwrap();

        assert_eq!(inference.detections.len(), 2);
        assert_eq!(inference.detections[0].class_name, "smoke");
        assert_eq!(inference.detections[1].class_name, "fire");
        assert_eq!(inference.detections[1].bbox, [5.0, 8.0, 20.0, 30.0]);
        assert_eq!(inference.annotated.dimensions(), (64, 48));
    }

    #[tokio::test]
    async fn test_annotation_draws_fire_boxes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame.png");
        write_test_image(&path, 32, 32);

        let engine = StubEngine::new(&["fire"], vec![raw(0, 0.8, [4.0, 4.0, 20.0, 20.0])]);
        let adapter = InferenceAdapter::with_engine(Arc::new(engine), Duration::from_secs(5));

        let inference = adapter.infer(&path).await.unwrap();

        assert_eq!(*inference.annotated.get_pixel(4, 4), FIRE_COLOR);
        assert_eq!(*inference.annotated.get_pixel(12, 4), FIRE_COLOR);
        assert_eq!(*inference.annotated.get_pixel(12, 12), Rgb([10, 10, 10]));
    }

    #[tokio::test]
    async fn test_unknown_class_index_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame.png");
        write_test_image(&path, 16, 16);

        let engine = StubEngine::new(&["fire"], vec![raw(5, 0.8, [0.0, 0.0, 1.0, 1.0])]);
        let adapter = InferenceAdapter::with_engine(Arc::new(engine), Duration::from_secs(5));

        assert!(matches!(
            adapter.infer(&path).await,
            Err(DetectionError::InferenceFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_image_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fake.jpg");
        std::fs::write(&path, b"%PDF-1.4 not an image").unwrap();

        let adapter = InferenceAdapter::with_engine(
            Arc::new(StubEngine::new(&["fire"], vec![])),
            Duration::from_secs(5),
        );

        assert!(matches!(
            adapter.infer(&path).await,
            Err(DetectionError::InferenceFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_engine_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame.png");
        write_test_image(&path, 8, 8);

        let mut engine = StubEngine::new(&["fire"], vec![]);
        engine.delay = Some(Duration::from_millis(500));
        let adapter = InferenceAdapter::with_engine(Arc::new(engine), Duration::from_millis(50));

        assert!(matches!(
            adapter.infer(&path).await,
            Err(DetectionError::InferenceTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_loader_failure_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let loader: EngineLoader = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("weights missing")
            }
            Ok(Arc::new(StubEngine::new(&["fire"], vec![])) as Arc<dyn DetectionEngine>)
        });
        let adapter = InferenceAdapter::new(loader, Duration::from_secs(5));

        assert!(matches!(
            adapter.engine().await,
            Err(DetectionError::InferenceFailed(_))
        ));
        assert!(adapter.engine().await.is_ok());
        assert!(adapter.engine().await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_draw_rect_clamps_to_image() {
        let mut img = RgbImage::new(10, 10);
        draw_rect(&mut img, [-5.0, -5.0, 50.0, 50.0], FIRE_COLOR, 1);
        assert_eq!(*img.get_pixel(0, 0), FIRE_COLOR);
        assert_eq!(*img.get_pixel(9, 9), FIRE_COLOR);
        assert_eq!(*img.get_pixel(5, 5), Rgb([0, 0, 0]));
    }
}
