use lumen_core::LlamaHparams;

/// Scratch buffers for one forward pass, sized once per session
#[derive(Debug, Clone)]
pub struct ActivationBuffer {
    /// Residual stream
    pub hidden: Vec<f32>,
    pub normed: Vec<f32>,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub attn_out: Vec<f32>,
    /// Output of `attn_output` and `ffn_down`, added back into `hidden`
    pub proj: Vec<f32>,
    pub gate: Vec<f32>,
    pub up: Vec<f32>,
    pub logits: Vec<f32>,
}

impl ActivationBuffer {
    pub fn new(h: &LlamaHparams) -> Self {
        let q_dim = h.n_heads * h.head_dim;
        Self {
            hidden: vec![0.0; h.n_embd],
            normed: vec![0.0; h.n_embd],
            q: vec![0.0; q_dim],
            k: vec![0.0; h.kv_dim()],
            v: vec![0.0; h.kv_dim()],
            attn_out: vec![0.0; q_dim],
            proj: vec![0.0; h.n_embd],
            gate: vec![0.0; h.n_ff],
            up: vec![0.0; h.n_ff],
            logits: vec![0.0; h.vocab_size],
        }
    }
}

/// `hidden += delta`
#[inline]
pub fn add_residual(hidden: &mut [f32], delta: &[f32]) {
    for (h, d) in hidden.iter_mut().zip(delta) {
        *h += d;
    }
}
