//! Small synthetic LLaMA checkpoints
//!
//! Deterministic weights, written through [`GgufBuilder`] so the full
//! parse/validate path runs in tests and benchmarks without a real model.

use crate::error::Result;
use crate::formats::gguf::MetadataValue;
use crate::formats::GgufBuilder;
use crate::loader::{layer_tensor, LAYER_TENSORS, OUTPUT, OUTPUT_NORM, TOKEN_EMBD};
use crate::tensor::QuantKind;

#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub n_embd: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub n_ff: usize,
    pub vocab_size: usize,
    pub context_length: usize,
    pub rope_theta: f32,
    /// Storage kind of the projection matrices
    pub weight_kind: QuantKind,
    /// Omit `output.weight` and reuse the embedding
    pub tied: bool,
    /// Written as `tokenizer.ggml.eos_token_id` when set
    pub eos_token_id: Option<u32>,
    pub seed: u32,
}

impl FixtureConfig {
    /// Embedding 8, one layer, two heads of width 4
    pub fn tiny() -> Self {
        Self {
            n_embd: 8,
            n_layers: 1,
            n_heads: 2,
            n_kv_heads: 2,
            n_ff: 16,
            vocab_size: 16,
            context_length: 16,
            rope_theta: 10_000.0,
            weight_kind: QuantKind::F32,
            tied: false,
            eos_token_id: Some(15),
            seed: 7,
        }
    }

    /// Grouped-query attention and rows wide enough for block quantization
    pub fn small_gqa(weight_kind: QuantKind) -> Self {
        Self {
            n_embd: 64,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            n_ff: 128,
            vocab_size: 32,
            context_length: 32,
            rope_theta: 10_000.0,
            weight_kind,
            tied: false,
            eos_token_id: Some(31),
            seed: 11,
        }
    }

    fn head_dim(&self) -> usize {
        self.n_embd / self.n_heads
    }

    /// `(rows, cols)` of a per-layer tensor
    fn layer_shape(&self, name: &str) -> (usize, usize) {
        let kv_dim = self.n_kv_heads * self.head_dim();
        match name {
            "attn_norm" | "ffn_norm" => (1, self.n_embd),
            "attn_q" | "attn_output" => (self.n_embd, self.n_embd),
            "attn_k" | "attn_v" => (kv_dim, self.n_embd),
            "ffn_gate" | "ffn_up" => (self.n_ff, self.n_embd),
            _ => (self.n_embd, self.n_ff),
        }
    }
}

/// Deterministic pseudo-random values in `[-1, 1)`
pub fn hash_values(seed: u32, salt: u32, n: usize) -> Vec<f32> {
    (0..n as u32)
        .map(|i| {
            let mut h = seed.wrapping_mul(0x9E37_79B9) ^ salt.wrapping_mul(0x85EB_CA6B) ^ i;
            h ^= h >> 16;
            h = h.wrapping_mul(0x7FEB_352D);
            h ^= h >> 15;
            h = h.wrapping_mul(0x846C_A68B);
            h ^= h >> 16;
            (h >> 8) as f32 / (1u32 << 23) as f32 - 1.0
        })
        .collect()
}

fn dims(rows: usize, cols: usize) -> Vec<usize> {
    if rows == 1 {
        vec![cols]
    } else {
        vec![cols, rows]
    }
}

/// Builder holding every tensor `keep` accepts
pub fn builder_filtered(cfg: &FixtureConfig, keep: impl Fn(&str) -> bool) -> Result<GgufBuilder> {
    let tokens = (0..cfg.vocab_size)
        .map(|i| MetadataValue::String(format!("<t{}>", i)))
        .collect::<Vec<_>>();
    let mut b = GgufBuilder::new()
        .string("general.architecture", "llama")
        .string("general.name", "lumen-fixture")
        .u32("llama.block_count", cfg.n_layers as u32)
        .u32("llama.embedding_length", cfg.n_embd as u32)
        .u32("llama.attention.head_count", cfg.n_heads as u32)
        .u32("llama.attention.head_count_kv", cfg.n_kv_heads as u32)
        .u32("llama.feed_forward_length", cfg.n_ff as u32)
        .u32("llama.context_length", cfg.context_length as u32)
        .f32("llama.rope.freq_base", cfg.rope_theta)
        .f32("llama.attention.layer_norm_rms_epsilon", 1e-5)
        .string("tokenizer.ggml.model", "gpt2")
        .metadata("tokenizer.ggml.tokens", MetadataValue::Array(tokens))
        .u32("tokenizer.ggml.bos_token_id", 0);
    if let Some(eos) = cfg.eos_token_id {
        b = b.u32("tokenizer.ggml.eos_token_id", eos);
    }

    let mut salt = 0u32;
    let mut next = |n: usize, scale: f32, offset: f32| {
        salt += 1;
        hash_values(cfg.seed, salt, n).into_iter().map(|v| v * scale + offset).collect::<Vec<_>>()
    };

    let embd = next(cfg.vocab_size * cfg.n_embd, 1.0, 0.0);
    if keep(TOKEN_EMBD) {
        b = b.tensor(TOKEN_EMBD, &[cfg.n_embd, cfg.vocab_size], QuantKind::F32, &embd)?;
    }

    for layer in 0..cfg.n_layers {
        for name in LAYER_TENSORS {
            let (rows, cols) = cfg.layer_shape(name);
            let full = layer_tensor(layer, name);
            let (values, kind) = if rows == 1 {
                (next(cols, 0.2, 1.0), QuantKind::F32)
            } else {
                (next(rows * cols, 1.0 / (cols as f32).sqrt(), 0.0), cfg.weight_kind)
            };
            if keep(&full) {
                b = b.tensor(&full, &dims(rows, cols), kind, &values)?;
            }
        }
    }

    let norm = next(cfg.n_embd, 0.2, 1.0);
    if keep(OUTPUT_NORM) {
        b = b.tensor(OUTPUT_NORM, &[cfg.n_embd], QuantKind::F32, &norm)?;
    }
    if !cfg.tied {
        let out = next(cfg.vocab_size * cfg.n_embd, 2.0 / (cfg.n_embd as f32).sqrt(), 0.0);
        if keep(OUTPUT) {
            b = b.tensor(OUTPUT, &[cfg.n_embd, cfg.vocab_size], cfg.weight_kind, &out)?;
        }
    }
    Ok(b)
}

pub fn build(cfg: &FixtureConfig) -> Result<Vec<u8>> {
    builder_filtered(cfg, |_| true)?.build()
}

/// The default tiny model as a GGUF image
pub fn tiny_llama() -> Result<Vec<u8>> {
    build(&FixtureConfig::tiny())
}
