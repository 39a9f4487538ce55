use std::{
    fs,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use super::catalog::ModelDescriptor;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no writable model directory: {primary:?} and fallback {fallback:?} both failed ({detail})")]
    NoWritableRoot {
        primary: PathBuf,
        fallback: PathBuf,
        detail: String,
    },
    #[error("failed to remove {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Maps model descriptors to local file paths. The primary root lives in
/// the per-user data directory; if it cannot be created the storage degrades
/// to a temp-dir root, once, and keeps that choice for the life of the
/// process so the same descriptor always resolves to the same path.
pub struct ModelStorage {
    primary: PathBuf,
    fallback: PathBuf,
    chosen: Mutex<Option<PathBuf>>,
}

impl ModelStorage {
    #[must_use]
    pub fn new() -> Self {
        let fallback = std::env::temp_dir().join("pocket-llm").join("models");
        let primary = ProjectDirs::from("com", "PocketLlm", "PocketLlm")
            .map(|dirs| dirs.data_dir().join("models"))
            .unwrap_or_else(|| fallback.clone());
        Self::with_roots(primary, fallback)
    }

    pub fn with_roots(primary: impl Into<PathBuf>, fallback: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            fallback: fallback.into(),
            chosen: Mutex::new(None),
        }
    }

    /// Root directory for model files, created on first use (idempotent).
    pub fn root(&self) -> Result<PathBuf, StorageError> {
        let mut chosen = self.chosen.lock();
        if let Some(root) = chosen.as_ref() {
            return Ok(root.clone());
        }

        match fs::create_dir_all(&self.primary) {
            Ok(()) => {
                *chosen = Some(self.primary.clone());
                Ok(self.primary.clone())
            }
            Err(primary_error) => {
                warn!(
                    "model directory {:?} unavailable ({primary_error}), falling back to {:?}",
                    self.primary, self.fallback
                );
                match fs::create_dir_all(&self.fallback) {
                    Ok(()) => {
                        *chosen = Some(self.fallback.clone());
                        Ok(self.fallback.clone())
                    }
                    Err(fallback_error) => Err(StorageError::NoWritableRoot {
                        primary: self.primary.clone(),
                        fallback: self.fallback.clone(),
                        detail: format!("{primary_error}; {fallback_error}"),
                    }),
                }
            }
        }
    }

    /// Local path for the descriptor's artifact. Purely derived from the
    /// storage root and the source URL, so re-resolution is idempotent.
    pub fn resolve(&self, descriptor: &ModelDescriptor) -> Result<PathBuf, StorageError> {
        Ok(self.root()?.join(artifact_filename(descriptor)))
    }

    /// Deletes the descriptor's local artifact if present.
    pub fn remove(&self, descriptor: &ModelDescriptor) -> Result<(), StorageError> {
        let path = self.resolve(descriptor)?;
        if path.exists() {
            fs::remove_file(&path).map_err(|source| StorageError::Remove {
                path: path.clone(),
                source,
            })?;
            info!("deleted model file {:?}", path);
        }
        Ok(())
    }
}

impl Default for ModelStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn artifact_filename(descriptor: &ModelDescriptor) -> String {
    filename_from_url(&descriptor.source_url).unwrap_or_else(|| format!("{}.gguf", descriptor.id))
}

fn filename_from_url(url: &str) -> Option<String> {
    let last_segment = url.split('/').last()?;
    let clean = last_segment.split('?').next()?.split('#').next()?.trim();
    if clean.is_empty() {
        None
    } else {
        Some(clean.to_string())
    }
}
