use crate::error::DetectionError;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Generate a collision-resistant file name keeping the given extension.
///
/// An empty extension yields a bare UUID.
pub fn generate_unique_name(extension: &str) -> String {
    if extension.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        format!("{}.{}", Uuid::new_v4(), extension)
    }
}

/// Writes uploads to a temporary directory under unique names
#[derive(Debug, Clone)]
pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `data` to a fresh staged file.
    ///
    /// The returned guard removes the file when dropped. A failed write
    /// removes whatever was partially written.
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn stage(&self, extension: &str, data: &[u8]) -> Result<StagedFile, DetectionError> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            DetectionError::StagingFailed(format!(
                "failed to create staging dir {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let name = generate_unique_name(extension);
        let path = self.dir.join(&name);

        if let Err(e) = write_fully(&path, data).await {
            if let Err(remove_err) = fs::remove_file(&path).await {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %remove_err, "Failed to remove partial staged file");
                }
            }
            return Err(DetectionError::StagingFailed(format!(
                "failed to write {}: {}",
                path.display(),
                e
            )));
        }

        debug!(path = %path.display(), "Upload staged");

        Ok(StagedFile { name, path })
    }
}

async fn write_fully(path: &Path, data: &[u8]) -> io::Result<()> {
    // create_new: a name collision must never clobber another invocation's file
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

/// An uploaded image on disk, owned by a single pipeline invocation
#[derive(Debug)]
pub struct StagedFile {
    name: String,
    path: PathBuf,
}

impl StagedFile {
    /// Generated unique name, reused as the artifact name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed staged file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staged file"),
        }
    }
}
