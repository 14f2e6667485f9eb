//! Archive paths for a determinism session.
//!
//! Artifact naming: `<output>/archive{i}.<ext>` for `i` in `0..repeats`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("repeats must be at least 1")]
    NoRepeats,
    #[error("artifact path generated twice: {}", .0.display())]
    Collision(PathBuf),
}

/// The full, ordered set of archive paths for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    paths: Vec<PathBuf>,
}

impl ArtifactSet {
    pub fn new(dir: &Path, repeats: usize, extension: &str) -> Result<Self, ArtifactError> {
        if repeats == 0 {
            return Err(ArtifactError::NoRepeats);
        }

        let mut seen = BTreeSet::new();
        let mut paths = Vec::with_capacity(repeats);
        for index in 0..repeats {
            let path = dir.join(artifact_name(index, extension));
            if !seen.insert(path.clone()) {
                return Err(ArtifactError::Collision(path));
            }
            paths.push(path);
        }

        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Paths that need a run: all of them when overwriting, otherwise only the
    /// ones not yet on disk.
    pub fn pending(&self, overwrite: bool) -> Vec<&Path> {
        self.paths
            .iter()
            .map(PathBuf::as_path)
            .filter(|path| overwrite || !path.exists())
            .collect()
    }

    /// Paths with no file on disk.
    pub fn missing(&self) -> Vec<&Path> {
        self.paths
            .iter()
            .map(PathBuf::as_path)
            .filter(|path| !path.exists())
            .collect()
    }
}

/// File name of the archive for run `index`.
pub fn artifact_name(index: usize, extension: &str) -> String {
    if extension.is_empty() {
        format!("archive{index}")
    } else {
        format!("archive{index}.{extension}")
    }
}
