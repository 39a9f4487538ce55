use std::{path::Path, sync::Arc};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::hashing::{ContentHasher, Sha256Hasher};

/// Outcome of checking a local artifact against its expectations. Flags are
/// only set for checks that actually ran; a skipped check never blocks
/// validity.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub exists: bool,
    pub size_match: bool,
    pub digest_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    #[must_use]
    pub fn detail(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "artifact failed validation".into())
    }
}

/// Decides whether a local artifact is usable without re-downloading.
/// Checks run cheapest-first: existence, then a size stat, and only when
/// both pass the full digest. Hashing happens on a blocking worker and is
/// serialized so the same file is never hashed twice concurrently.
pub struct Validator {
    hasher: Arc<dyn ContentHasher>,
    hash_gate: Mutex<()>,
}

impl Validator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(Arc::new(Sha256Hasher))
    }

    pub fn with_hasher(hasher: Arc<dyn ContentHasher>) -> Self {
        Self {
            hasher,
            hash_gate: Mutex::new(()),
        }
    }

    pub async fn validate(
        &self,
        path: &Path,
        expected_size: Option<u64>,
        expected_digest: Option<&str>,
    ) -> ValidationResult {
        let mut result = ValidationResult::default();

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(_) => {
                result.error = Some("model file does not exist".into());
                return result;
            }
        };
        result.exists = true;

        if let Some(expected) = expected_size {
            let actual = metadata.len();
            result.actual_size = Some(actual);
            result.expected_size = Some(expected);
            if actual != expected {
                result.error = Some(format!(
                    "size mismatch: expected {expected} bytes, got {actual}"
                ));
                return result;
            }
            result.size_match = true;
        }

        if let Some(expected) = expected_digest {
            let expected = expected.to_ascii_lowercase();
            let actual = {
                let _gate = self.hash_gate.lock().await;
                debug!("hashing {:?}", path);
                let hasher = Arc::clone(&self.hasher);
                let target = path.to_path_buf();
                match tokio::task::spawn_blocking(move || hasher.digest_file(&target)).await {
                    Ok(Ok(digest)) => digest,
                    Ok(Err(error)) => {
                        result.error = Some(format!("digest computation failed: {error}"));
                        return result;
                    }
                    Err(error) => {
                        result.error = Some(format!("digest worker failed: {error}"));
                        return result;
                    }
                }
            };
            result.expected_digest = Some(expected.clone());
            result.actual_digest = Some(actual.clone());
            if actual != expected {
                result.error = Some(format!(
                    "digest mismatch: expected {expected}, got {actual}"
                ));
                return result;
            }
            result.digest_match = true;
        }

        result.is_valid = true;
        result
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
