#[cfg(feature = "llama-engine")]
mod llama;

#[cfg(feature = "llama-engine")]
pub use llama::LlamaEngine;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime knobs handed to the engine when a model is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineOptions {
    pub context_tokens: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub lock_in_memory: bool,
    pub max_generated_tokens: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            context_tokens: 2048,
            batch_size: 512,
            threads: 4,
            lock_in_memory: true,
            max_generated_tokens: 1024,
        }
    }
}

/// The bytes on disk can be valid by hash and still unusable: the engine is
/// the last judge of the artifact.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine failed to load {path:?}: {detail}")]
    Load { path: PathBuf, detail: String },
    #[error("model file {path:?} is not usable: {detail}")]
    Artifact { path: PathBuf, detail: String },
    #[error("no model is loaded")]
    NotLoaded,
    #[error("another generation is already running")]
    Busy,
    #[error("text generation failed: {detail}")]
    Generation { detail: String },
}

/// Loads a validated local artifact and produces sessions that stream text.
/// Loading and generation are blocking, CPU/memory-heavy calls; callers run
/// them off the interactive flow.
pub trait InferenceEngine: Send + Sync {
    fn load(
        &self,
        path: &Path,
        options: &EngineOptions,
    ) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// One loaded model instance. Dropping the session releases its resources.
pub trait EngineSession: Send {
    /// Streams the reply through `on_text`, which receives the accumulated
    /// response after every chunk, and returns the final text.
    fn generate(
        &mut self,
        system_prompt: &str,
        user_prompt: &str,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError>;
}

/// Stand-in backend used when no native engine feature is enabled. It
/// enforces the same artifact preconditions as a real engine and emits
/// canned text.
pub struct SimulatedEngine;

impl InferenceEngine for SimulatedEngine {
    fn load(
        &self,
        path: &Path,
        _options: &EngineOptions,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        let metadata = std::fs::metadata(path).map_err(|error| EngineError::Artifact {
            path: path.to_path_buf(),
            detail: error.to_string(),
        })?;
        if metadata.len() == 0 {
            return Err(EngineError::Artifact {
                path: path.to_path_buf(),
                detail: "file is empty".into(),
            });
        }
        Ok(Box::new(SimulatedSession))
    }
}

struct SimulatedSession;

impl EngineSession for SimulatedSession {
    fn generate(
        &mut self,
        _system_prompt: &str,
        user_prompt: &str,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError> {
        let reply = format!("simulated response to: {}", user_prompt.trim());
        let mut accumulated = String::new();
        for word in reply.split_inclusive(' ') {
            accumulated.push_str(word);
            on_text(&accumulated);
        }
        Ok(accumulated)
    }
}
