//! Resolved model weights and the f32 materialization cache

use crate::config::WeightStorage;
use lumen_core::error::Result;
use lumen_core::loader::{layer_tensor, OUTPUT_NORM, TOKEN_EMBD};
use lumen_core::{BackendKind, LoadedModel, TensorId, TensorStore, TensorView};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Dequantized copies of tensors, one per (tensor, backend kind)
///
/// Shared by reference between sessions built over the same model.
#[derive(Debug, Default)]
pub struct WeightCache {
    entries: Mutex<HashMap<(TensorId, BackendKind), Arc<[f32]>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl WeightCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// f32 copy of `id`, materialized on first request
    pub fn get(
        &self,
        store: &TensorStore,
        id: TensorId,
        backend: BackendKind,
    ) -> Result<Arc<[f32]>> {
        let mut entries = self.entries.lock();
        if let Some(values) = entries.get(&(id, backend)) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(values));
        }
        let view = store.view_by_id(id);
        let values: Arc<[f32]> = view.to_f32_vec()?.into();
        log::debug!("Materialized '{}' ({} values) for {}", view.name(), values.len(), backend);
        self.misses.fetch_add(1, Ordering::Relaxed);
        entries.insert((id, backend), Arc::clone(&values));
        Ok(values)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// A projection matrix as the kernels see it
#[derive(Debug, Clone)]
pub enum Matrix {
    /// Read from the store in its file encoding
    Stored(TensorId),
    /// Dense f32 copy held by the [`WeightCache`]
    Dense { id: TensorId, values: Arc<[f32]> },
}

impl Matrix {
    pub fn id(&self) -> TensorId {
        match self {
            Matrix::Stored(id) | Matrix::Dense { id, .. } => *id,
        }
    }

    pub fn view<'a>(&'a self, store: &'a TensorStore) -> Result<TensorView<'a>> {
        match self {
            Matrix::Stored(id) => Ok(store.view_by_id(*id)),
            Matrix::Dense { id, values } => {
                let stored = store.view_by_id(*id);
                TensorView::from_f32(stored.name(), stored.rows(), stored.cols(), values)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attn_norm: Arc<[f32]>,
    pub attn_q: Matrix,
    pub attn_k: Matrix,
    pub attn_v: Matrix,
    pub attn_output: Matrix,
    pub ffn_norm: Arc<[f32]>,
    pub ffn_gate: Matrix,
    pub ffn_up: Matrix,
    pub ffn_down: Matrix,
}

/// Every tensor a forward pass touches, resolved once per session
#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub token_embd: TensorId,
    pub layers: Vec<LayerWeights>,
    pub output_norm: Arc<[f32]>,
    /// `output.weight`, or the embedding table when the model ties them
    pub output: Matrix,
}

impl ModelWeights {
    /// Resolve names to ids; norms are always f32, projections follow `storage`
    ///
    /// The GPU backend keeps its own f32 device copies of store-backed
    /// tensors, so projections stay store-backed there whatever `storage` says.
    pub fn resolve(
        model: &LoadedModel,
        storage: WeightStorage,
        cache: &WeightCache,
        backend: BackendKind,
    ) -> Result<Self> {
        let store = &model.store;
        let norm = |name: &str| cache.get(store, store.id(name)?, backend);
        let dense = storage == WeightStorage::F32 && backend != BackendKind::Gpu;
        let matrix = |name: &str| -> Result<Matrix> {
            let id = store.id(name)?;
            Ok(if dense {
                Matrix::Dense { id, values: cache.get(store, id, backend)? }
            } else {
                Matrix::Stored(id)
            })
        };

        let layers = (0..model.hparams.n_layers)
            .map(|l| {
                Ok(LayerWeights {
                    attn_norm: norm(&layer_tensor(l, "attn_norm"))?,
                    attn_q: matrix(&layer_tensor(l, "attn_q"))?,
                    attn_k: matrix(&layer_tensor(l, "attn_k"))?,
                    attn_v: matrix(&layer_tensor(l, "attn_v"))?,
                    attn_output: matrix(&layer_tensor(l, "attn_output"))?,
                    ffn_norm: norm(&layer_tensor(l, "ffn_norm"))?,
                    ffn_gate: matrix(&layer_tensor(l, "ffn_gate"))?,
                    ffn_up: matrix(&layer_tensor(l, "ffn_up"))?,
                    ffn_down: matrix(&layer_tensor(l, "ffn_down"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            token_embd: store.id(TOKEN_EMBD)?,
            layers,
            output_norm: norm(OUTPUT_NORM)?,
            output: matrix(model.output_tensor())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::fixture::{build, FixtureConfig};
    use lumen_core::{load_from_bytes, QuantKind};

    fn q8_model() -> LoadedModel {
        load_from_bytes(build(&FixtureConfig::small_gqa(QuantKind::Q8_0)).unwrap()).unwrap()
    }

    #[test]
    fn test_cache_is_keyed_by_backend() {
        let model = q8_model();
        let cache = WeightCache::new();
        let id = model.store.id("blk.0.attn_q.weight").unwrap();
        let a = cache.get(&model.store, id, BackendKind::Plain).unwrap();
        let b = cache.get(&model.store, id, BackendKind::Plain).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        cache.get(&model.store, id, BackendKind::Multithread).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn test_dense_view_matches_stored() {
        let model = q8_model();
        let cache = WeightCache::new();
        let native =
            ModelWeights::resolve(&model, WeightStorage::Native, &cache, BackendKind::Plain)
                .unwrap();
        let dense =
            ModelWeights::resolve(&model, WeightStorage::F32, &cache, BackendKind::Plain).unwrap();

        let stored = native.layers[1].ffn_down.view(&model.store).unwrap();
        let f32_view = dense.layers[1].ffn_down.view(&model.store).unwrap();
        assert_eq!(stored.kind(), QuantKind::Q8_0);
        assert_eq!(f32_view.kind(), QuantKind::F32);
        assert_eq!(stored.name(), f32_view.name());
        assert_eq!(stored.to_f32_vec().unwrap(), f32_view.to_f32_vec().unwrap());
    }

    #[test]
    fn test_gpu_projections_stay_store_backed() {
        let model = q8_model();
        let cache = WeightCache::new();
        let weights =
            ModelWeights::resolve(&model, WeightStorage::F32, &cache, BackendKind::Gpu).unwrap();
        assert!(matches!(weights.layers[0].attn_q, Matrix::Stored(_)));
        assert!(weights.layers[0].attn_q.view(&model.store).unwrap().origin().is_some());
        // only the norms were materialized
        assert_eq!(cache.len(), 2 * model.hparams.n_layers + 1);
    }

    #[test]
    fn test_tied_output_uses_embedding() {
        let mut cfg = FixtureConfig::tiny();
        cfg.tied = true;
        let model = load_from_bytes(build(&cfg).unwrap()).unwrap();
        let cache = WeightCache::new();
        let weights =
            ModelWeights::resolve(&model, WeightStorage::Native, &cache, BackendKind::Plain)
                .unwrap();
        assert_eq!(weights.output.id(), weights.token_embd);
    }
}
