use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    Gpu,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodeParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.4,
            top_k: 40,
            top_p: 0.9,
        }
    }
}

/// Static description of one downloadable LLM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub display_name: String,
    pub url: String,
    pub file_name: String,
    /// Size hint used for progress when the server sends no length.
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub decode: DecodeParams,
    #[serde(default = "default_accelerator")]
    pub accelerator: Accelerator,
    /// Accepts images alongside the prompt.
    #[serde(default)]
    pub multimodal: bool,
    /// The host wants a bearer token (gated Hugging Face repos).
    #[serde(default)]
    pub needs_auth: bool,
}

fn default_accelerator() -> Accelerator {
    Accelerator::Cpu
}

pub fn builtin_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            name: "gemma-3n-e2b".to_string(),
            display_name: "Gemma 3n E2B (int4)".to_string(),
            url: "https://huggingface.co/google/gemma-3n-E2B-it-litert-preview/resolve/main/gemma-3n-E2B-it-int4.task".to_string(),
            file_name: "gemma-3n-E2B-it-int4.task".to_string(),
            expected_size: None,
            decode: DecodeParams::default(),
            accelerator: Accelerator::Gpu,
            multimodal: true,
            needs_auth: true,
        },
        ModelDescriptor {
            name: "gemma-3n-e4b".to_string(),
            display_name: "Gemma 3n E4B (int4)".to_string(),
            url: "https://huggingface.co/google/gemma-3n-E4B-it-litert-preview/resolve/main/gemma-3n-E4B-it-int4.task".to_string(),
            file_name: "gemma-3n-E4B-it-int4.task".to_string(),
            expected_size: None,
            decode: DecodeParams::default(),
            accelerator: Accelerator::Gpu,
            multimodal: true,
            needs_auth: true,
        },
        ModelDescriptor {
            name: "gemma3-1b".to_string(),
            display_name: "Gemma 3 1B (q4)".to_string(),
            url: "https://huggingface.co/litert-community/Gemma3-1B-IT/resolve/main/Gemma3-1B-IT_multi-prefill-seq_q4_ekv2048.task".to_string(),
            file_name: "Gemma3-1B-IT_multi-prefill-seq_q4_ekv2048.task".to_string(),
            expected_size: None,
            decode: DecodeParams {
                max_tokens: 2048,
                temperature: 0.3,
                top_k: 64,
                top_p: 0.95,
            },
            accelerator: Accelerator::Cpu,
            multimodal: false,
            needs_auth: true,
        },
    ]
}

/// Known models and where their weights live on disk.
#[derive(Clone, Debug)]
pub struct ModelRegistry {
    models_dir: PathBuf,
    models: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    pub fn new(models_dir: impl Into<PathBuf>, models: Vec<ModelDescriptor>) -> Self {
        Self {
            models_dir: models_dir.into(),
            models,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn find(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .find(|model| model.name.eq_ignore_ascii_case(name))
    }

    pub fn path_for(&self, model: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(&model.file_name)
    }

    /// Downloads land under a temporary name and are renamed when complete,
    /// so a non-empty file at the final path is a finished download. A known
    /// expected size must match as well.
    pub fn is_downloaded(&self, model: &ModelDescriptor) -> bool {
        std::fs::metadata(self.path_for(model))
            .map(|meta| {
                meta.is_file()
                    && meta.len() > 0
                    && model.expected_size.map_or(true, |size| size == meta.len())
            })
            .unwrap_or(false)
    }

    /// First downloaded model, preferring multimodal ones.
    pub fn first_downloaded(&self) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .filter(|model| self.is_downloaded(model))
            .max_by_key(|model| model.multimodal)
    }
}
