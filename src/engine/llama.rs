use std::{path::Path, sync::Arc};

use llama_cpp::{standard_sampler::StandardSampler, LlamaModel, LlamaParams, SessionParams};
use tracing::info;

use super::{EngineError, EngineOptions, EngineSession, InferenceEngine};

const STOP_SEQUENCES: [&str; 2] = ["<|user|>", "<|system|>"];

/// llama.cpp-backed engine for GGUF artifacts.
pub struct LlamaEngine;

impl InferenceEngine for LlamaEngine {
    fn load(
        &self,
        path: &Path,
        options: &EngineOptions,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        let model = LlamaModel::load_from_file(path, LlamaParams::default()).map_err(|error| {
            EngineError::Load {
                path: path.to_path_buf(),
                detail: format!("{error:?}"),
            }
        })?;
        info!("loaded llama model from {:?}", path);
        Ok(Box::new(LlamaSession {
            model: Arc::new(model),
            max_tokens: options.max_generated_tokens,
        }))
    }
}

struct LlamaSession {
    model: Arc<LlamaModel>,
    max_tokens: usize,
}

impl EngineSession for LlamaSession {
    fn generate(
        &mut self,
        system_prompt: &str,
        user_prompt: &str,
        on_text: &mut dyn FnMut(&str),
    ) -> Result<String, EngineError> {
        let mut session =
            self.model
                .create_session(SessionParams::default())
                .map_err(|error| EngineError::Generation {
                    detail: format!("failed to create session: {error:?}"),
                })?;

        let prompt =
            format!("<|system|>\n{system_prompt}\n<|user|>\n{user_prompt}\n<|assistant|>\n");
        session
            .advance_context(&prompt)
            .map_err(|error| EngineError::Generation {
                detail: format!("failed to advance context: {error}"),
            })?;

        let sampler = StandardSampler::default();
        let mut stream = session
            .start_completing_with(sampler, self.max_tokens)
            .map_err(|error| EngineError::Generation {
                detail: format!("failed to start completion: {error:?}"),
            })?
            .into_strings();

        let mut accumulated = String::new();
        while let Some(chunk) = stream.next() {
            if chunk.is_empty() {
                continue;
            }
            accumulated.push_str(&chunk);
            if let Some(cut) = STOP_SEQUENCES
                .iter()
                .filter_map(|stop| accumulated.find(stop))
                .min()
            {
                accumulated.truncate(cut);
                on_text(&accumulated);
                break;
            }
            on_text(&accumulated);
        }
        drop(stream);

        Ok(accumulated.trim().to_string())
    }
}
