use crate::error::DetectionError;
use image::{ImageFormat, RgbImage};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Durable, web-servable store for annotated fire images
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Encode `image` and publish it under `name`, returning the artifact
    /// reference.
    ///
    /// The format follows the extension of `name`. The image is written to a
    /// hidden temporary file and renamed into place, so the final path only
    /// exists once the write completed.
    #[instrument(skip(self, image), fields(dir = %self.dir.display()))]
    pub async fn publish(&self, image: RgbImage, name: &str) -> Result<String, DetectionError> {
        let dir = self.dir.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || write_artifact(&dir, &name, &image).map(|()| name))
            .await
            .map_err(|e| {
                DetectionError::ArtifactWriteFailed(format!("artifact writer panicked: {}", e))
            })?
    }

    /// Remove a published artifact. Best-effort: failures are logged.
    pub async fn discard(&self, name: &str) {
        let path = self.path_for(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Discarded artifact"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to discard artifact"),
        }
    }
}

fn write_artifact(dir: &Path, name: &str, image: &RgbImage) -> Result<(), DetectionError> {
    let format = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ImageFormat::from_extension)
        .ok_or_else(|| {
            DetectionError::ArtifactWriteFailed(format!("no image format for artifact {:?}", name))
        })?;

    std::fs::create_dir_all(dir).map_err(|e| {
        DetectionError::ArtifactWriteFailed(format!(
            "failed to create artifact dir {}: {}",
            dir.display(),
            e
        ))
    })?;

    let final_path = dir.join(name);
    let partial_path = dir.join(format!(".{}.partial", name));

    let written = image
        .save_with_format(&partial_path, format)
        .map_err(|e| e.to_string())
        .and_then(|()| std::fs::rename(&partial_path, &final_path).map_err(|e| e.to_string()));

    if let Err(e) = written {
        if let Err(remove_err) = std::fs::remove_file(&partial_path) {
            if remove_err.kind() != io::ErrorKind::NotFound {
                warn!(path = %partial_path.display(), error = %remove_err, "Failed to remove partial artifact");
            }
        }
        return Err(DetectionError::ArtifactWriteFailed(format!(
            "failed to write {}: {}",
            final_path.display(),
            e
        )));
    }

    debug!(path = %final_path.display(), "Artifact published");
    Ok(())
}
