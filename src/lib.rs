//! Backend for an on-device LLM chat application: acquires model artifacts
//! (download with retry, streaming integrity verification, local caching)
//! and drives the inference engine that consumes them. The presentation
//! layer sits on top of [`LlmRuntime`] and only ever sees one combined
//! progress signal and structured failure kinds.

pub mod core;
pub mod engine;
pub mod models;

pub use crate::core::config::{load_config, save_config, BackendConfig};
pub use crate::core::events::{AcquisitionPhase, ProgressEvent};
pub use crate::core::runtime::{
    AcquisitionError, AcquisitionState, FailureKind, LlmRuntime, ReadyModel,
};
pub use crate::engine::{EngineError, EngineOptions, InferenceEngine, SimulatedEngine};
pub use crate::models::{builtin_models, find_model, ModelDescriptor, ValidationResult};

use tracing::metadata::LevelFilter;

/// Installs the global tracing subscriber. The level comes from
/// `POCKET_LLM_LOG` and defaults to info.
pub fn setup_logging() {
    let filter = std::env::var("POCKET_LLM_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
