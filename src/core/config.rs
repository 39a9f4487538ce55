use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::engine::EngineOptions;
use crate::models::RetryPolicy;

const CONFIG_FILE: &str = "backend.json";

/// Backend settings persisted between launches. Model descriptors are input
/// supplied by the caller, never configuration owned here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    /// Overrides the default per-user model directory.
    pub storage_root: Option<PathBuf>,
    /// Bearer token for gated Hugging Face downloads.
    pub hf_token: Option<String>,
    pub retry: RetryPolicy,
    pub engine: EngineOptions,
}

/// Reads the persisted config, falling back to defaults when the file is
/// missing or unreadable. A broken config file must never keep the backend
/// from starting.
pub fn load_config() -> BackendConfig {
    match config_path().and_then(|path| read_config(&path)) {
        Ok(config) => config,
        Err(error) => {
            tracing::debug!("using default backend config: {error:?}");
            BackendConfig::default()
        }
    }
}

pub fn save_config(config: &BackendConfig) -> Result<()> {
    let path = config_path()?;
    write_config(&path, config)
}

fn config_path() -> Result<PathBuf> {
    let project_dirs =
        ProjectDirs::from("com", "PocketLlm", "PocketLlm").context("missing project directories")?;
    Ok(project_dirs.config_dir().join(CONFIG_FILE))
}

fn read_config(path: &Path) -> Result<BackendConfig> {
    if !path.exists() {
        return Ok(BackendConfig::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("backend config could not be parsed")
}

fn write_config(path: &Path, config: &BackendConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(config).context("serialize backend config failed")?;
    fs::write(path, serialized).with_context(|| format!("write config to {path:?}"))?;
    Ok(())
}
