//! LLaMA hyperparameters resolved from metadata and tensor shapes

use crate::error::{Error, Result};
use crate::metadata::ModelMetadata;
use crate::store::TensorStore;
use serde::{Deserialize, Serialize};

pub const SUPPORTED_ARCHITECTURES: [&str; 1] = ["llama"];
pub const DEFAULT_ROPE_THETA: f32 = 10_000.0;
pub const DEFAULT_RMS_EPS: f32 = 1e-5;
pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaHparams {
    pub architecture: String,
    pub n_layers: usize,
    pub n_embd: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub n_ff: usize,
    pub vocab_size: usize,
    pub context_length: usize,
    pub rope_theta: f32,
    /// Number of leading dimensions of each head that are rotated
    pub rope_dim: usize,
    pub rms_eps: f32,
}

impl LlamaHparams {
    /// Read required and optional keys; shapes fill in what metadata omits
    pub fn from_metadata(meta: &ModelMetadata, store: &TensorStore) -> Result<Self> {
        let arch = meta.architecture()?.to_string();
        if !SUPPORTED_ARCHITECTURES.contains(&arch.as_str()) {
            return Err(Error::Format(format!("Unsupported architecture: {}", arch)));
        }
        let key = |suffix: &str| format!("{}.{}", arch, suffix);

        let n_layers = meta.require_usize(&key("block_count"))?;
        let n_embd = meta.require_usize(&key("embedding_length"))?;
        let n_heads = meta.require_usize(&key("attention.head_count"))?;
        let n_kv_heads = meta.get_usize(&key("attention.head_count_kv"))?.unwrap_or(n_heads);

        if n_layers == 0 || n_embd == 0 || n_heads == 0 || n_kv_heads == 0 {
            return Err(Error::Format(format!(
                "Degenerate dimensions: layers={} embd={} heads={} kv_heads={}",
                n_layers, n_embd, n_heads, n_kv_heads
            )));
        }
        if n_embd % n_heads != 0 {
            return Err(Error::Format(format!(
                "Embedding length {} is not divisible by head count {}",
                n_embd, n_heads
            )));
        }
        if n_heads % n_kv_heads != 0 {
            return Err(Error::Format(format!(
                "Head count {} is not a multiple of kv head count {}",
                n_heads, n_kv_heads
            )));
        }
        let head_dim = n_embd / n_heads;

        let rope_dim = meta.get_usize(&key("rope.dimension_count"))?.unwrap_or(head_dim);
        if rope_dim > head_dim || rope_dim % 2 != 0 {
            return Err(Error::Format(format!(
                "RoPE dimension {} must be even and at most the head dimension {}",
                rope_dim, head_dim
            )));
        }

        let n_ff = match meta.get_usize(&key("feed_forward_length"))? {
            Some(n) => n,
            None => store
                .desc("blk.0.ffn_gate.weight")
                .map(|d| d.shape.rows())
                .ok_or_else(|| Error::missing_tensor("blk.0.ffn_gate.weight"))?,
        };

        let embd_rows = store
            .desc("token_embd.weight")
            .map(|d| d.shape.rows())
            .ok_or_else(|| Error::missing_tensor("token_embd.weight"))?;
        let vocab_size = match meta.get_usize(&key("vocab_size"))? {
            Some(v) if v != embd_rows => {
                return Err(Error::Format(format!(
                    "vocab_size {} disagrees with token_embd.weight rows {}",
                    v, embd_rows
                )))
            }
            _ => embd_rows,
        };

        let hparams = Self {
            n_layers,
            n_embd,
            n_heads,
            n_kv_heads,
            head_dim,
            n_ff,
            vocab_size,
            context_length: meta
                .get_usize(&key("context_length"))?
                .unwrap_or(DEFAULT_CONTEXT_LENGTH),
            rope_theta: meta.get_f32(&key("rope.freq_base"))?.unwrap_or(DEFAULT_ROPE_THETA),
            rope_dim,
            rms_eps: meta
                .get_f32(&key("attention.layer_norm_rms_epsilon"))?
                .unwrap_or(DEFAULT_RMS_EPS),
            architecture: arch,
        };

        log::info!(
            "{}: {} layers, embd {}, heads {}/{}, ffn {}, vocab {}, ctx {}",
            hparams.architecture,
            hparams.n_layers,
            hparams.n_embd,
            hparams.n_heads,
            hparams.n_kv_heads,
            hparams.n_ff,
            hparams.vocab_size,
            hparams.context_length
        );
        Ok(hparams)
    }

    /// Width of one position in the KV cache
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }
}
