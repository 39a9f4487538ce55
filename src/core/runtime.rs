use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::config::BackendConfig;
use crate::core::events::{
    remap, AcquisitionPhase, ProgressEvent, ProgressGuard, DOWNLOAD_BAND, ENGINE_BAND,
    VALIDATE_BAND,
};
use crate::core::session::{SessionRegistry, SessionToken};
use crate::engine::{EngineError, EngineOptions, EngineSession, InferenceEngine, SimulatedEngine};
use crate::models::{
    fetch_with_retry, DownloadError, FetchRequest, HttpDownloader, ModelDescriptor, ModelFetcher,
    ModelStorage, RetryPolicy, StorageError, Validator,
};

/// Where the current (or last) acquisition run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AcquisitionState {
    Idle,
    Downloading,
    Validating,
    Initializing,
    Ready,
    Failed(FailureKind),
}

/// Structured failure class, attached when the error is created so the
/// presentation layer can pick guidance without parsing message text:
/// download failures invite a retry, validation failures a different
/// descriptor, engine failures a smaller model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Download,
    Validation,
    Engine,
    Storage,
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("download failed: {0}")]
    Download(#[source] DownloadError),
    #[error("artifact validation failed: {detail}")]
    Validation { detail: String },
    #[error("engine rejected the model: {0}")]
    Engine(#[source] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("acquisition canceled")]
    Canceled,
}

impl AcquisitionError {
    /// `None` for cancellation, which is not a failure.
    #[must_use]
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            AcquisitionError::Download(_) => Some(FailureKind::Download),
            AcquisitionError::Validation { .. } => Some(FailureKind::Validation),
            AcquisitionError::Engine(_) => Some(FailureKind::Engine),
            AcquisitionError::Storage(_) => Some(FailureKind::Storage),
            AcquisitionError::Canceled => None,
        }
    }
}

/// A successfully acquired model: verified on disk and loaded in the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyModel {
    pub model_id: String,
    pub path: PathBuf,
}

struct LoadedModel {
    model_id: String,
    path: PathBuf,
    /// Taken while a generation borrows the session.
    session: Option<Box<dyn EngineSession>>,
}

/// Sequences validate → download → validate → engine-load for one model at a
/// time, owns the acquisition state machine and the loaded engine session,
/// and maps every sub-phase into the single 0-100 progress scale.
pub struct LlmRuntime {
    storage: ModelStorage,
    validator: Validator,
    fetcher: Arc<dyn ModelFetcher>,
    engine: Arc<dyn InferenceEngine>,
    retry: RetryPolicy,
    engine_options: EngineOptions,
    auth_token: Option<String>,
    sessions: SessionRegistry,
    state: Mutex<AcquisitionState>,
    loaded: Mutex<Option<LoadedModel>>,
}

impl LlmRuntime {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        let storage = match &config.storage_root {
            Some(root) => ModelStorage::with_roots(
                root.clone(),
                std::env::temp_dir().join("pocket-llm").join("models"),
            ),
            None => ModelStorage::new(),
        };
        Self::with_parts(
            storage,
            Arc::new(HttpDownloader::new()),
            Arc::new(SimulatedEngine),
            config,
        )
    }

    /// Wires explicit collaborators; tests inject counting fetchers,
    /// scripted engines and temp-dir storage through here.
    pub fn with_parts(
        storage: ModelStorage,
        fetcher: Arc<dyn ModelFetcher>,
        engine: Arc<dyn InferenceEngine>,
        config: BackendConfig,
    ) -> Self {
        Self {
            storage,
            validator: Validator::new(),
            fetcher,
            engine,
            retry: config.retry,
            engine_options: config.engine,
            auth_token: config.hf_token,
            sessions: SessionRegistry::new(),
            state: Mutex::new(AcquisitionState::Idle),
            loaded: Mutex::new(None),
        }
    }

    /// Drives the full pipeline for `descriptor`: reuse a valid local file
    /// or download it, verify integrity, then load it into the engine.
    /// Starting a new acquisition supersedes any in-flight one; the
    /// superseded run stops emitting callbacks at its next suspension point
    /// and resolves to `Canceled` for its own caller.
    pub async fn acquire_model<F>(
        &self,
        descriptor: &ModelDescriptor,
        on_progress: F,
    ) -> Result<ReadyModel, AcquisitionError>
    where
        F: Fn(ProgressEvent) + Send + Sync,
    {
        let token = self.sessions.begin();
        let result = self
            .run_acquisition(descriptor, &token, &on_progress)
            .await;

        match &result {
            Ok(ready) => {
                self.set_state(&token, AcquisitionState::Ready);
                info!("model {} ready at {:?}", ready.model_id, ready.path);
            }
            Err(AcquisitionError::Canceled) => {
                // superseded or canceled: the successor owns the state now
            }
            Err(error) => {
                if let Some(kind) = error.kind() {
                    self.set_state(&token, AcquisitionState::Failed(kind));
                }
                warn!("acquisition of model {} failed: {error}", descriptor.id);
            }
        }

        token.finish();
        result
    }

    async fn run_acquisition(
        &self,
        descriptor: &ModelDescriptor,
        token: &SessionToken,
        on_progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> Result<ReadyModel, AcquisitionError> {
        // stale sessions go silent even if an in-flight operation completes
        let gated = move |event: ProgressEvent| {
            if token.is_current() {
                on_progress(event);
            }
        };
        let progress = ProgressGuard::new(&gated);

        let path = self.storage.resolve(descriptor)?;
        let expected_size = descriptor.expected_size();
        let expected_digest = descriptor.expected_digest();

        progress.emit(AcquisitionPhase::Checking, 0.0, "Checking local model...");
        let existing = self
            .validator
            .validate(&path, expected_size, expected_digest.as_deref())
            .await;
        self.ensure_current(token)?;

        if existing.is_valid {
            info!(
                "model {} already valid at {:?}, skipping download",
                descriptor.id, path
            );
        } else {
            if existing.exists {
                info!("local file {:?} failed validation, re-downloading", path);
                remove_file_quiet(&path).await;
            }

            self.set_state(token, AcquisitionState::Downloading);
            let url = descriptor.download_url();
            let request = FetchRequest {
                url: &url,
                dest: &path,
                expected_size,
                auth_token: self.auth_token.as_deref(),
            };
            let cancelled = || !token.is_current();
            let download_progress = |raw: f32, _bytes: u64| {
                progress.emit(
                    AcquisitionPhase::Downloading,
                    remap(raw, DOWNLOAD_BAND.0, DOWNLOAD_BAND.1),
                    format!("Downloading model... {}%", raw.round() as u32),
                );
            };
            fetch_with_retry(
                self.fetcher.as_ref(),
                &request,
                &self.retry,
                &download_progress,
                &cancelled,
            )
            .await
            .map_err(|error| match error {
                DownloadError::Canceled => AcquisitionError::Canceled,
                other => AcquisitionError::Download(other),
            })?;
            self.ensure_current(token)?;

            self.set_state(token, AcquisitionState::Validating);
            progress.emit(
                AcquisitionPhase::Validating,
                VALIDATE_BAND.0,
                "Verifying downloaded model...",
            );
            let fresh = self
                .validator
                .validate(&path, expected_size, expected_digest.as_deref())
                .await;
            self.ensure_current(token)?;
            if !fresh.is_valid {
                // the bytes transferred, but integrity defines success;
                // leave nothing behind for the next run to trust
                remove_file_quiet(&path).await;
                return Err(AcquisitionError::Validation {
                    detail: fresh.detail(),
                });
            }
            progress.emit(AcquisitionPhase::Validating, VALIDATE_BAND.1, "Model verified");
        }

        self.set_state(token, AcquisitionState::Initializing);
        progress.emit(
            AcquisitionPhase::Initializing,
            ENGINE_BAND.0,
            "Initializing engine...",
        );
        let engine_path = normalize_engine_path(&path);
        verify_engine_access(&engine_path)
            .await
            .map_err(AcquisitionError::Engine)?;
        self.ensure_current(token)?;

        // release the previous model before loading the next so two never
        // occupy memory at once
        if self.loaded.lock().take().is_some() {
            progress.emit(
                AcquisitionPhase::Initializing,
                remap(10.0, ENGINE_BAND.0, ENGINE_BAND.1),
                "Releasing previous model...",
            );
        }

        let engine = Arc::clone(&self.engine);
        let options = self.engine_options.clone();
        let load_path = engine_path.clone();
        let session = tokio::task::spawn_blocking(move || engine.load(&load_path, &options))
            .await
            .map_err(|error| {
                AcquisitionError::Engine(EngineError::Load {
                    path: engine_path.clone(),
                    detail: error.to_string(),
                })
            })?
            .map_err(AcquisitionError::Engine)?;
        // canceled mid-load: drop the freshly loaded session instead of
        // installing it
        self.ensure_current(token)?;

        *self.loaded.lock() = Some(LoadedModel {
            model_id: descriptor.id.clone(),
            path: engine_path.clone(),
            session: Some(session),
        });
        progress.emit(AcquisitionPhase::Ready, 100.0, "Model ready");

        Ok(ReadyModel {
            model_id: descriptor.id.clone(),
            path: engine_path,
        })
    }

    /// Best-effort cancel, observed at the next suspension point. The
    /// canceled run emits no further callbacks.
    pub fn cancel_acquisition(&self) {
        if self.sessions.is_active() {
            info!("canceling in-flight model acquisition");
        }
        self.sessions.cancel_active();
        *self.state.lock() = AcquisitionState::Idle;
    }

    /// Deletes the local artifact so the next acquisition downloads afresh.
    /// If that model is currently loaded it is released first.
    pub fn clear_cache(&self, descriptor: &ModelDescriptor) -> Result<(), StorageError> {
        {
            let mut loaded = self.loaded.lock();
            if loaded
                .as_ref()
                .is_some_and(|current| current.model_id == descriptor.id)
            {
                *loaded = None;
                *self.state.lock() = AcquisitionState::Idle;
            }
        }
        self.storage.remove(descriptor)
    }

    /// Streams a reply for `user_prompt`; `on_text` receives the
    /// accumulated response after every chunk. Generation is CPU-bound and
    /// runs on a blocking worker.
    pub async fn generate<F>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        on_text: F,
    ) -> Result<String, EngineError>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let (model_id, mut session) = {
            let mut guard = self.loaded.lock();
            let Some(current) = guard.as_mut() else {
                return Err(EngineError::NotLoaded);
            };
            let Some(session) = current.session.take() else {
                return Err(EngineError::Busy);
            };
            (current.model_id.clone(), session)
        };

        let system = system_prompt.to_string();
        let prompt = user_prompt.to_string();
        let mut on_text = on_text;
        let outcome = tokio::task::spawn_blocking(move || {
            let result = session.generate(&system, &prompt, &mut on_text);
            (session, result)
        })
        .await;

        match outcome {
            Ok((session, result)) => {
                let mut guard = self.loaded.lock();
                if let Some(current) = guard.as_mut() {
                    if current.model_id == model_id && current.session.is_none() {
                        current.session = Some(session);
                    }
                }
                result
            }
            Err(join_error) => {
                // the session died with the worker; drop the slot so the
                // next acquire starts clean
                *self.loaded.lock() = None;
                Err(EngineError::Generation {
                    detail: join_error.to_string(),
                })
            }
        }
    }

    /// Releases the loaded model and its engine resources. Safe to call
    /// when nothing is loaded.
    pub fn release_engine(&self) {
        if self.loaded.lock().take().is_some() {
            *self.state.lock() = AcquisitionState::Idle;
            info!("released engine model");
        }
    }

    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_acquiring(&self) -> bool {
        self.sessions.is_active()
    }

    #[must_use]
    pub fn loaded_model(&self) -> Option<ReadyModel> {
        self.loaded.lock().as_ref().map(|current| ReadyModel {
            model_id: current.model_id.clone(),
            path: current.path.clone(),
        })
    }

    fn set_state(&self, token: &SessionToken, state: AcquisitionState) {
        if token.is_current() {
            *self.state.lock() = state;
        }
    }

    fn ensure_current(&self, token: &SessionToken) -> Result<(), AcquisitionError> {
        if token.is_current() {
            Ok(())
        } else {
            Err(AcquisitionError::Canceled)
        }
    }
}

/// Upper layers on some platforms hand back `file://` URIs; the native
/// loader wants a plain absolute path.
fn normalize_engine_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match raw.strip_prefix("file://") {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

/// Cheap pre-initialization probe, distinct from full validation: the file
/// must exist, be non-empty and openable before the engine maps it.
async fn verify_engine_access(path: &Path) -> Result<(), EngineError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|error| EngineError::Artifact {
            path: path.to_path_buf(),
            detail: error.to_string(),
        })?;
    if metadata.len() == 0 {
        return Err(EngineError::Artifact {
            path: path.to_path_buf(),
            detail: "file is empty".into(),
        });
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|error| EngineError::Artifact {
            path: path.to_path_buf(),
            detail: format!("not readable: {error}"),
        })?;
    Ok(())
}

async fn remove_file_quiet(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!("failed to delete {:?}: {error}", path),
    }
}
