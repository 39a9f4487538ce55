use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Identity and integrity expectations for one downloadable model artifact.
/// Descriptors are supplied by the caller (or taken from the built-in
/// catalog) and never mutated by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub source_url: String,
    /// Expected artifact size in bytes; 0 means unknown.
    #[serde(default)]
    pub size_bytes: u64,
    /// Expected SHA-256 as lowercase hex; absent means unverified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    #[must_use]
    pub fn expected_size(&self) -> Option<u64> {
        (self.size_bytes > 0).then_some(self.size_bytes)
    }

    #[must_use]
    pub fn expected_digest(&self) -> Option<String> {
        self.sha256
            .as_ref()
            .map(|digest| digest.to_ascii_lowercase())
    }

    /// URL to actually fetch, with Hugging Face browser links rewritten to
    /// their direct-download form.
    #[must_use]
    pub fn download_url(&self) -> String {
        normalize_source_url(&self.source_url)
    }
}

/// Rewrites Hugging Face `/blob/` page URLs to `/resolve/` download URLs.
/// URLs that already point at a downloadable resource pass through.
pub fn normalize_source_url(url: &str) -> String {
    if url.contains("/resolve/") || url.contains("cdn-lfs.huggingface.co") {
        return url.to_string();
    }
    match url.split_once("/blob/") {
        Some((base, rest)) => format!("{base}/resolve/{rest}"),
        None => url.to_string(),
    }
}

static BUILTIN_MODELS: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    vec![
        ModelDescriptor {
            id: "phi-3.5-mini-instruct-q6_k".into(),
            display_name: "Phi 3.5 Mini Instruct (Q6_K)".into(),
            source_url: "https://huggingface.co/microsoft/Phi-3.5-mini-instruct-GGUF/resolve/main/Phi-3.5-mini-instruct-Q6_K.gguf".into(),
            size_bytes: 2_461_204_480,
            sha256: Some("0259452056e3bafd4d01dac0ae6cc2b8ec11001361701945662c0f749e0fd0ba".into()),
        },
        ModelDescriptor {
            id: "gemma-2b-q6_k".into(),
            display_name: "Gemma 2B (Q6_K)".into(),
            source_url: "https://huggingface.co/brittlewis12/gemma-2b-GGUF/resolve/main/gemma-2b.Q6_K.gguf".into(),
            size_bytes: 1_825_361_920,
            sha256: Some("e3a4304663a6151abfc66147454678763c43991ddb1a77eba6c5fe6acc96b1a5".into()),
        },
        ModelDescriptor {
            id: "llama-2-7b-q8_0".into(),
            display_name: "Llama 2 7B (Q8_0)".into(),
            source_url: "https://huggingface.co/TheBloke/Llama-2-7B-GGUF/resolve/main/llama-2-7b.Q8_0.gguf".into(),
            size_bytes: 7_730_000_000,
            sha256: Some("f1415d117f94261fd9869ac5dabd98b3dc36648cfb7c6d84e5b473aca74ab64d".into()),
        },
        ModelDescriptor {
            id: "mistral-7b-instruct-v0.3-q6_k".into(),
            display_name: "Mistral 7B Instruct v0.3 (Q6_K)".into(),
            source_url: "https://huggingface.co/MaziyarPanahi/Mistral-7B-Instruct-v0.3-GGUF/resolve/main/Mistral-7B-Instruct-v0.3.Q6_K.gguf".into(),
            size_bytes: 6_334_000_000,
            sha256: Some("d58a20f828bca2e163342d43324f953f2edf9bdd5886bfe15c4b81b5b70a3b7b".into()),
        },
    ]
});

/// Models the application ships with out of the box.
pub fn builtin_models() -> &'static [ModelDescriptor] {
    &BUILTIN_MODELS
}

pub fn find_model(id: &str) -> Option<&'static ModelDescriptor> {
    BUILTIN_MODELS.iter().find(|model| model.id == id)
}
