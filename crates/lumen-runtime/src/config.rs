//! Session and generation configuration

use lumen_core::error::{Error, Result};
use lumen_core::{BackendKind, RopeStyle};
use serde::{Deserialize, Serialize};

/// How projection weights reach the kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeightStorage {
    /// Read quantized bytes through views, dequantizing on access
    #[default]
    Native,
    /// Materialize each weight to f32 once and reuse it for the session
    F32,
}

/// Settings fixed for the lifetime of one inference session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub backend: BackendKind,
    /// Worker count for the multithread backend; `None` uses every CPU
    pub num_threads: Option<usize>,
    /// Cap below the model's context length; `None` uses the model's
    pub context_length: Option<usize>,
    pub weight_storage: WeightStorage,
    /// Pairing used by RoPE; GGUF LLaMA checkpoints are interleaved
    pub rope_style: RopeStyle,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Plain,
            num_threads: None,
            context_length: None,
            weight_storage: WeightStorage::Native,
            rope_style: RopeStyle::Interleaved,
        }
    }
}

impl SessionConfig {
    pub fn new(backend: BackendKind) -> Self {
        Self { backend, ..Default::default() }
    }

    pub fn with_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    pub fn with_context_length(mut self, n: usize) -> Self {
        self.context_length = Some(n);
        self
    }

    pub fn with_weight_storage(mut self, storage: WeightStorage) -> Self {
        self.weight_storage = storage;
        self
    }

    pub fn with_rope_style(mut self, style: RopeStyle) -> Self {
        self.rope_style = style;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("Invalid session config JSON: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Runtime(format!("Failed to serialize session config: {}", e)))
    }

    /// Context window for a model whose maximum is `model_context`
    pub fn resolve_context_length(&self, model_context: usize) -> Result<usize> {
        match self.context_length {
            None => Ok(model_context),
            Some(0) => Err(Error::InvalidArgument("Context length must be at least 1".into())),
            Some(n) if n > model_context => Err(Error::InvalidArgument(format!(
                "Context length {} exceeds the model's {}",
                n, model_context
            ))),
            Some(n) => Ok(n),
        }
    }
}

/// Token generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of new tokens
    pub max_tokens: usize,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Top-k filter, 0 disables it
    pub top_k: usize,
    /// Nucleus threshold, 1.0 disables it
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub seed: u64,
    /// Extra token ids that end generation, besides the model's EOS
    pub stop_tokens: Vec<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            seed: 42,
            stop_tokens: Vec::new(),
        }
    }
}

impl GenerationConfig {
    pub fn greedy(max_tokens: usize) -> Self {
        Self { max_tokens, ..Default::default() }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("Invalid generation config JSON: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Runtime(format!("Failed to serialize generation config: {}", e)))
    }
}
