//! Single-token LLaMA forward pass over a chosen backend

use crate::activations::{add_residual, ActivationBuffer};
use crate::backend::create_backend;
use crate::config::{GenerationConfig, SessionConfig};
use crate::kv_cache::KVCache;
use crate::sampling::LogitsProcessor;
use crate::weights::{ModelWeights, WeightCache};
use lumen_core::error::{Error, Result};
use lumen_core::{AttentionShape, Kernels, LoadedModel, RopeSpec};
use std::sync::Arc;

/// One decoding stream over a shared model
///
/// Owns its KV cache and activations; the model and backend may be shared
/// with other sessions.
pub struct InferenceSession {
    model: Arc<LoadedModel>,
    backend: Arc<dyn Kernels>,
    weights: ModelWeights,
    cache: KVCache,
    act: ActivationBuffer,
    rope: RopeSpec,
    attn: AttentionShape,
    pos: usize,
    /// Set when a step fails part way; cleared by `reset`
    poisoned: bool,
}

impl InferenceSession {
    /// Create the backend `config` names and a session over it
    pub fn from_config(model: Arc<LoadedModel>, config: &SessionConfig) -> Result<Self> {
        let backend = create_backend(config)?;
        Self::new(model, backend, config)
    }

    pub fn new(
        model: Arc<LoadedModel>,
        backend: Arc<dyn Kernels>,
        config: &SessionConfig,
    ) -> Result<Self> {
        Self::with_weight_cache(model, backend, config, &WeightCache::new())
    }

    /// Like [`InferenceSession::new`], reusing materialized weights from `weight_cache`
    pub fn with_weight_cache(
        model: Arc<LoadedModel>,
        backend: Arc<dyn Kernels>,
        config: &SessionConfig,
        weight_cache: &WeightCache,
    ) -> Result<Self> {
        if backend.kind() != config.backend {
            return Err(Error::InvalidArgument(format!(
                "Session configured for the {} backend was given {}",
                config.backend,
                backend.name()
            )));
        }
        let h = &model.hparams;
        let context_length = config.resolve_context_length(h.context_length)?;
        let rope = RopeSpec::new(h.head_dim, h.rope_theta)
            .with_rope_dim(h.rope_dim)
            .with_style(config.rope_style);
        rope.validate()?;
        let attn = AttentionShape {
            n_heads: h.n_heads,
            n_kv_heads: h.n_kv_heads,
            head_dim: h.head_dim,
        };

        let weights =
            ModelWeights::resolve(&model, config.weight_storage, weight_cache, backend.kind())?;
        let cache = KVCache::new(h.n_layers, context_length, h.kv_dim());
        let act = ActivationBuffer::new(h);

        log::info!(
            "Session on {} backend: {} layers, context {}, {:?} weights",
            backend.name(),
            h.n_layers,
            context_length,
            config.weight_storage
        );
        Ok(Self {
            model,
            backend,
            weights,
            cache,
            act,
            rope,
            attn,
            pos: 0,
            poisoned: false,
        })
    }

    /// Next position to be written
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn context_length(&self) -> usize {
        self.cache.capacity()
    }

    pub fn model(&self) -> &Arc<LoadedModel> {
        &self.model
    }

    pub fn backend(&self) -> &Arc<dyn Kernels> {
        &self.backend
    }

    pub fn kv_cache(&self) -> &KVCache {
        &self.cache
    }

    /// Logits of the most recent step
    pub fn logits(&self) -> &[f32] {
        &self.act.logits
    }

    /// Feed `token` at the current position and return next-token logits
    pub fn step(&mut self, token: u32) -> Result<&[f32]> {
        if self.poisoned {
            return Err(Error::Runtime("A previous step failed; reset the session".into()));
        }
        let vocab = self.model.hparams.vocab_size;
        if token as usize >= vocab {
            return Err(Error::InvalidArgument(format!(
                "Token {} out of range for vocabulary of {}",
                token, vocab
            )));
        }
        if self.pos >= self.cache.capacity() {
            return Err(Error::CacheExhausted {
                position: self.pos,
                capacity: self.cache.capacity(),
            });
        }

        if let Err(e) = self.forward(token) {
            self.poisoned = true;
            return Err(e);
        }
        self.pos += 1;
        Ok(&self.act.logits)
    }

    fn forward(&mut self, token: u32) -> Result<()> {
        let pos = self.pos;
        let h = &self.model.hparams;
        let store = &self.model.store;
        let k = self.backend.as_ref();
        let act = &mut self.act;

        let embd = store.view_by_id(self.weights.token_embd);
        embd.dequantize_row(token as usize, &mut act.hidden)?;

        for (layer, w) in self.weights.layers.iter().enumerate() {
            k.rmsnorm(&act.hidden, &w.attn_norm, h.rms_eps, &mut act.normed)?;
            k.gemv(&w.attn_q.view(store)?, &act.normed, &mut act.q)?;
            k.gemv(&w.attn_k.view(store)?, &act.normed, &mut act.k)?;
            k.gemv(&w.attn_v.view(store)?, &act.normed, &mut act.v)?;
            k.rope(&mut act.q, pos, &self.rope)?;
            k.rope(&mut act.k, pos, &self.rope)?;

            self.cache.write(layer, pos, &act.k, &act.v)?;
            k.attention(
                &act.q,
                self.cache.keys(layer),
                self.cache.values(layer),
                &self.attn,
                pos,
                &mut act.attn_out,
            )?;
            k.gemv(&w.attn_output.view(store)?, &act.attn_out, &mut act.proj)?;
            add_residual(&mut act.hidden, &act.proj);

            k.rmsnorm(&act.hidden, &w.ffn_norm, h.rms_eps, &mut act.normed)?;
            k.gemv(&w.ffn_gate.view(store)?, &act.normed, &mut act.gate)?;
            k.gemv(&w.ffn_up.view(store)?, &act.normed, &mut act.up)?;
            k.silu_mul(&mut act.gate, &act.up)?;
            k.gemv(&w.ffn_down.view(store)?, &act.gate, &mut act.proj)?;
            add_residual(&mut act.hidden, &act.proj);
        }

        k.rmsnorm(&act.hidden, &self.weights.output_norm, h.rms_eps, &mut act.normed)?;
        k.gemv(&self.weights.output.view(store)?, &act.normed, &mut act.logits)?;
        Ok(())
    }

    /// Prefill `prompt`, then sample up to `config.max_tokens` new tokens
    ///
    /// Stops early on the model's EOS token or any of `config.stop_tokens`;
    /// the stopping token is not included in the result. Prompt tokens count
    /// toward the repetition penalty. Continues from the
    /// current position, so call [`InferenceSession::reset`] first to start
    /// a fresh sequence.
    pub fn generate(&mut self, prompt: &[u32], config: &GenerationConfig) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            return Err(Error::InvalidArgument("Prompt must contain at least one token".into()));
        }
        let mut stop = config.stop_tokens.clone();
        stop.extend(self.model.eos_token_id());
        let mut sampler = LogitsProcessor::from_config(config);
        sampler.extend_history(prompt);

        let mut logits = Vec::new();
        for &token in prompt {
            logits.clear();
            logits.extend_from_slice(self.step(token)?);
        }

        let mut generated = Vec::with_capacity(config.max_tokens);
        while generated.len() < config.max_tokens {
            let next = sampler.sample(&mut logits)?;
            if stop.contains(&next) {
                log::debug!("Stop token {} after {} tokens", next, generated.len());
                break;
            }
            generated.push(next);
            if generated.len() == config.max_tokens {
                break;
            }
            logits.clear();
            logits.extend_from_slice(self.step(next)?);
        }
        Ok(generated)
    }

    /// Forget every cached position and start again at 0
    pub fn reset(&mut self) {
        self.cache.reset();
        self.act.logits.fill(0.0);
        self.pos = 0;
        self.poisoned = false;
    }
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("backend", &self.backend.name())
            .field("position", &self.pos)
            .field("context_length", &self.cache.capacity())
            .finish()
    }
}
