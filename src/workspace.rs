//! Scoped working storage for one batch run.
//!
//! The batch directory is a [`TempDir`]: dropping the [`Workspace`] removes
//! it and everything beneath it, on every exit path including `?` returns
//! and panics. Each record gets its own `record-NNNNN` subdirectory so
//! concurrent workers never share a path; a [`RecordScope`] removes that
//! subdirectory as soon as the record terminates.

use crate::artifact::{ArtifactSlot, ArtifactStage};
use crate::error::BatchError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// The per-batch working-storage area.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh batch directory under `root` (or the system temp dir).
    pub fn acquire(root: Option<&Path>) -> Result<Self, BatchError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("certmail-batch-");

        let result = match root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };

        let dir = result.map_err(|source| BatchError::WorkspaceUnavailable {
            root: root
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir),
            source,
        })?;

        debug!("Acquired working storage at {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create the private subdirectory for the record at `index`.
    pub async fn record_scope(&self, index: usize) -> std::io::Result<RecordScope> {
        let root = self.dir.path().join(format!("record-{:05}", index + 1));
        let rendered = root.join("rendered");
        let converted = root.join("converted");
        tokio::fs::create_dir_all(&rendered).await?;
        tokio::fs::create_dir_all(&converted).await?;
        Ok(RecordScope {
            root,
            rendered,
            converted,
        })
    }

    /// Remove the batch directory now, reporting any failure.
    ///
    /// Dropping the workspace does the same but can only log.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to remove working storage {}: {}", path.display(), e);
        } else {
            debug!("Released working storage at {}", path.display());
        }
    }
}

/// One record's private working directory. Removed on drop.
#[derive(Debug)]
pub struct RecordScope {
    root: PathBuf,
    rendered: PathBuf,
    converted: PathBuf,
}

impl RecordScope {
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, stage: ArtifactStage) -> &Path {
        match stage {
            ArtifactStage::Rendered => &self.rendered,
            ArtifactStage::Converted => &self.converted,
        }
    }

    pub fn slot<'a>(&'a self, stage: ArtifactStage, record_id: &'a str, stem: &'a str) -> ArtifactSlot<'a> {
        ArtifactSlot {
            record_id,
            dir: self.dir_for(stage),
            stem,
        }
    }
}

// Synchronous: the directory must be gone before the record's outcome is
// reported, including while unwinding.
impl Drop for RecordScope {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.root.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn workspace_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::acquire(Some(root.path())).unwrap();
            let scope = ws.record_scope(0).await.unwrap();
            std::fs::write(scope.dir_for(ArtifactStage::Rendered).join("a.txt"), b"x").unwrap();
            std::mem::forget(scope);
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn record_scope_is_removed_on_drop() {
        let ws = Workspace::acquire(None).unwrap();
        let scope = ws.record_scope(4).await.unwrap();
        let dir = scope.path().to_path_buf();
        assert!(dir.ends_with("record-00005"));
        assert!(scope.dir_for(ArtifactStage::Converted).is_dir());
        drop(scope);
        assert!(!dir.exists());
        assert!(ws.path().exists());
    }

    #[test]
    fn close_removes_directory() {
        let ws = Workspace::acquire(None).unwrap();
        let path = ws.path().to_path_buf();
        ws.close();
        assert!(!path.exists());
    }

    #[test]
    fn acquire_fails_for_missing_root() {
        let err = Workspace::acquire(Some(Path::new("/definitely/not/a/dir"))).unwrap_err();
        assert!(matches!(err, BatchError::WorkspaceUnavailable { .. }));
    }
}
