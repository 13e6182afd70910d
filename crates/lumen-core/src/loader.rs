//! Model loading: parse, map, validate

use crate::error::{Error, Result};
use crate::formats::gguf::{GGUFParser, ModelMeta};
use crate::hparams::LlamaHparams;
use crate::metadata::ModelMetadata;
use crate::store::TensorStore;
use crate::vocab::Vocabulary;
use memmap2::Mmap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

pub const TOKEN_EMBD: &str = "token_embd.weight";
pub const OUTPUT_NORM: &str = "output_norm.weight";
pub const OUTPUT: &str = "output.weight";

/// Per-layer tensors, named `blk.{layer}.{name}.weight`
pub const LAYER_TENSORS: [&str; 9] = [
    "attn_norm",
    "attn_q",
    "attn_k",
    "attn_v",
    "attn_output",
    "ffn_norm",
    "ffn_gate",
    "ffn_up",
    "ffn_down",
];

pub fn layer_tensor(layer: usize, name: &str) -> String {
    format!("blk.{}.{}.weight", layer, name)
}

/// A validated model, ready to be shared between sessions
#[derive(Debug)]
pub struct LoadedModel {
    pub version: u32,
    pub metadata: ModelMetadata,
    pub hparams: LlamaHparams,
    pub store: TensorStore,
    pub vocab: Option<Vocabulary>,
}

impl LoadedModel {
    /// Output projection tensor; the embedding table when the file ties them
    pub fn output_tensor(&self) -> &'static str {
        if self.store.contains(OUTPUT) {
            OUTPUT
        } else {
            TOKEN_EMBD
        }
    }

    pub fn is_tied(&self) -> bool {
        !self.store.contains(OUTPUT)
    }

    /// End-of-sequence token, if the vocabulary names one
    pub fn eos_token_id(&self) -> Option<u32> {
        self.vocab.as_ref().and_then(Vocabulary::eos_token_id)
    }
}

/// Memory-map and load a GGUF file
pub fn load(path: impl AsRef<Path>) -> Result<LoadedModel> {
    let path = path.as_ref();
    let file = File::open(path)?;
    // SAFETY: the mapping is only read. Modifying the file while it is
    // mapped is outside what this loader supports.
    let mmap = unsafe { Mmap::map(&file)? };

    let meta = GGUFParser::new(Cursor::new(&mmap[..])).parse_header()?;
    let store = TensorStore::from_mmap(mmap, &meta)?;
    log::info!("Mapped {} ({} tensors, {} bytes)", path.display(), store.len(), meta.file_len);
    finish(meta, store)
}

/// Load a GGUF image already held in memory
pub fn load_from_bytes(bytes: Vec<u8>) -> Result<LoadedModel> {
    let meta = GGUFParser::new(Cursor::new(&bytes[..])).parse_header()?;
    let store = TensorStore::from_bytes(bytes, &meta)?;
    finish(meta, store)
}

fn finish(meta: ModelMeta, store: TensorStore) -> Result<LoadedModel> {
    let hparams = LlamaHparams::from_metadata(&meta.metadata, &store)?;
    validate_tensors(&store, &hparams)?;
    let vocab = Vocabulary::from_metadata(&meta.metadata)?;
    if let Some(v) = &vocab {
        if v.len() != hparams.vocab_size {
            log::warn!(
                "Vocabulary has {} tokens but the embedding has {} rows",
                v.len(),
                hparams.vocab_size
            );
        }
    }
    if !store.contains(OUTPUT) {
        log::debug!("No {}, output projection is tied to {}", OUTPUT, TOKEN_EMBD);
    }
    Ok(LoadedModel { version: meta.version, metadata: meta.metadata, hparams, store, vocab })
}

/// Expected `(rows, cols)` of a tensor the architecture needs
fn expected_shape(name: &str, h: &LlamaHparams) -> (usize, usize) {
    let q_dim = h.n_heads * h.head_dim;
    match name {
        "attn_norm" | "ffn_norm" => (1, h.n_embd),
        "attn_q" => (q_dim, h.n_embd),
        "attn_k" | "attn_v" => (h.kv_dim(), h.n_embd),
        "attn_output" => (h.n_embd, q_dim),
        "ffn_gate" | "ffn_up" => (h.n_ff, h.n_embd),
        "ffn_down" => (h.n_embd, h.n_ff),
        _ => (0, 0),
    }
}

fn check_shape(store: &TensorStore, name: &str, rows: usize, cols: usize) -> Result<()> {
    let desc = store.desc(name).ok_or_else(|| Error::missing_tensor(name))?;
    if desc.shape.rows() != rows || desc.shape.cols() != cols {
        return Err(Error::InvalidShape(format!(
            "Tensor '{}' has shape {} but the model expects {} rows of {}",
            name, desc.shape, rows, cols
        )));
    }
    Ok(())
}

/// Every required tensor must exist with the shape the hyperparameters imply
pub fn validate_tensors(store: &TensorStore, h: &LlamaHparams) -> Result<()> {
    check_shape(store, TOKEN_EMBD, h.vocab_size, h.n_embd)?;
    check_shape(store, OUTPUT_NORM, 1, h.n_embd)?;
    for layer in 0..h.n_layers {
        for name in LAYER_TENSORS {
            let (rows, cols) = expected_shape(name, h);
            check_shape(store, &layer_tensor(layer, name), rows, cols)?;
        }
    }
    if store.contains(OUTPUT) {
        check_shape(store, OUTPUT, h.vocab_size, h.n_embd)?;
    }
    Ok(())
}
