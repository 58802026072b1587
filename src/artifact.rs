//! Stage artifacts: files in working storage owned by one record.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which stage produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStage {
    Rendered,
    Converted,
}

/// A named file payload produced by a stage for exactly one record.
///
/// Artifacts are not `Clone`: ownership moves from the producing stage to
/// the consuming one, and [`Artifact::release`] removes the file once the
/// consumer is done with it.
#[derive(Debug, PartialEq, Eq)]
pub struct Artifact {
    record_id: String,
    stage: ArtifactStage,
    path: PathBuf,
}

impl Artifact {
    pub fn new(record_id: impl Into<String>, stage: ArtifactStage, path: impl Into<PathBuf>) -> Self {
        Self {
            record_id: record_id.into(),
            stage,
            path: path.into(),
        }
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn stage(&self) -> ArtifactStage {
        self.stage
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name (no directory), used in error messages and as the
    /// attachment name.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Remove the backing file. Missing files are not an error.
    pub fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not release artifact {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Where a stage should write its artifact for one record.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactSlot<'a> {
    pub record_id: &'a str,
    pub dir: &'a Path,
    pub stem: &'a str,
}

impl ArtifactSlot<'_> {
    /// `<dir>/<stem>.<ext>`
    pub fn path_with_extension(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, ext))
    }

    pub fn artifact(&self, stage: ArtifactStage, path: impl Into<PathBuf>) -> Artifact {
        Artifact::new(self.record_id, stage, path)
    }
}
