//! Per-session key/value cache

use lumen_core::error::{Error, Result};

/// Keys and values for every layer, laid out `[layer][pos][kv_dim]`
///
/// Positions are written strictly in order, once each, until [`KVCache::reset`].
#[derive(Debug, Clone)]
pub struct KVCache {
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    /// Next free position per layer
    filled: Vec<usize>,
    capacity: usize,
    kv_dim: usize,
}

impl KVCache {
    pub fn new(n_layers: usize, capacity: usize, kv_dim: usize) -> Self {
        let size = capacity * kv_dim;
        Self {
            keys: vec![vec![0.0; size]; n_layers],
            values: vec![vec![0.0; size]; n_layers],
            filled: vec![0; n_layers],
            capacity,
            kv_dim,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    pub fn n_layers(&self) -> usize {
        self.filled.len()
    }

    /// Positions written in `layer`
    pub fn len(&self, layer: usize) -> usize {
        self.filled.get(layer).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.filled.iter().all(|&f| f == 0)
    }

    /// Store the key and value rows of `layer` at `pos`
    pub fn write(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) -> Result<()> {
        if layer >= self.n_layers() {
            return Err(Error::InvalidArgument(format!(
                "Layer {} out of range for a {}-layer cache",
                layer,
                self.n_layers()
            )));
        }
        if k.len() != self.kv_dim || v.len() != self.kv_dim {
            return Err(Error::InvalidShape(format!(
                "KV rows must have {} elements, got keys {} values {}",
                self.kv_dim,
                k.len(),
                v.len()
            )));
        }
        if pos >= self.capacity {
            return Err(Error::CacheExhausted { position: pos, capacity: self.capacity });
        }
        let next = self.filled[layer];
        if pos < next {
            return Err(Error::PositionAlreadyWritten { layer, position: pos });
        }
        if pos > next {
            return Err(Error::InvalidArgument(format!(
                "KV write at position {} in layer {} skips past next free position {}",
                pos, layer, next
            )));
        }

        let start = pos * self.kv_dim;
        self.keys[layer][start..start + self.kv_dim].copy_from_slice(k);
        self.values[layer][start..start + self.kv_dim].copy_from_slice(v);
        self.filled[layer] = pos + 1;
        Ok(())
    }

    /// Cached keys of `layer`, positions `0..len(layer)`
    pub fn keys(&self, layer: usize) -> &[f32] {
        &self.keys[layer][..self.filled[layer] * self.kv_dim]
    }

    /// Cached values of `layer`, positions `0..len(layer)`
    pub fn values(&self, layer: usize) -> &[f32] {
        &self.values[layer][..self.filled[layer] * self.kv_dim]
    }

    pub fn reset(&mut self) {
        for layer in 0..self.n_layers() {
            self.keys[layer].fill(0.0);
            self.values[layer].fill(0.0);
        }
        self.filled.fill(0);
    }
}
