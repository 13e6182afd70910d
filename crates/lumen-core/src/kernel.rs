//! Kernel contract shared by every backend
//!
//! A backend implements [`Kernels`]; the transformer runner only ever talks
//! to `dyn Kernels`. All buffers are supplied by the caller, so one backend
//! instance can serve several sessions.

use crate::error::{Error, Result};
use crate::store::TensorView;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution strategy behind a [`Kernels`] implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Direct loops, the reference for every comparison
    #[default]
    Plain,
    /// Kernel dispatch abstraction on the calling thread
    Sequential,
    /// Kernel dispatch fanned out over a worker pool
    Multithread,
    /// Compute shaders on a GPU device
    Gpu,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] =
        [BackendKind::Plain, BackendKind::Sequential, BackendKind::Multithread, BackendKind::Gpu];

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Plain => "plain",
            BackendKind::Sequential => "sequential",
            BackendKind::Multithread => "multithread",
            BackendKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown backend: {}", s)))
    }
}

/// Which dimensions form a rotation pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RopeStyle {
    /// Adjacent pairs `(2i, 2i + 1)`, the layout of LLaMA GGUF checkpoints
    #[default]
    Interleaved,
    /// Split halves `(i, i + rope_dim / 2)`
    Neox,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeSpec {
    pub head_dim: usize,
    /// Leading dimensions of each head that are rotated
    pub rope_dim: usize,
    pub theta: f32,
    pub style: RopeStyle,
}

impl RopeSpec {
    pub fn new(head_dim: usize, theta: f32) -> Self {
        Self { head_dim, rope_dim: head_dim, theta, style: RopeStyle::Interleaved }
    }

    pub fn with_style(mut self, style: RopeStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_rope_dim(mut self, rope_dim: usize) -> Self {
        self.rope_dim = rope_dim;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 || self.rope_dim % 2 != 0 || self.rope_dim > self.head_dim {
            return Err(Error::InvalidArgument(format!(
                "Invalid RoPE geometry: head_dim {}, rope_dim {}",
                self.head_dim, self.rope_dim
            )));
        }
        Ok(())
    }

    /// Indices of the two dimensions rotated by pair `i`
    #[inline]
    pub fn pair(&self, i: usize) -> (usize, usize) {
        match self.style {
            RopeStyle::Interleaved => (2 * i, 2 * i + 1),
            RopeStyle::Neox => (i, i + self.rope_dim / 2),
        }
    }

    /// `(cos, sin)` of every pair's angle at `pos`
    pub fn cos_sin(&self, pos: usize) -> Vec<(f32, f32)> {
        (0..self.rope_dim / 2)
            .map(|i| {
                let freq = 1.0 / self.theta.powf((2 * i) as f32 / self.rope_dim as f32);
                let angle = pos as f32 * freq;
                (angle.cos(), angle.sin())
            })
            .collect()
    }
}

/// Rotate one head in place using a precomputed `cos_sin` table
#[inline]
pub fn rope_head(head: &mut [f32], table: &[(f32, f32)], spec: &RopeSpec) {
    for (i, &(c, s)) in table.iter().enumerate() {
        let (a, b) = spec.pair(i);
        let v0 = head[a];
        let v1 = head[b];
        head[a] = v0 * c - v1 * s;
        head[b] = v0 * s + v1 * c;
    }
}

/// Rotate every head of `x` forward by position `pos`
pub fn apply_rope(x: &mut [f32], pos: usize, spec: &RopeSpec) -> Result<()> {
    check_rope(x, spec)?;
    let table = spec.cos_sin(pos);
    for head in x.chunks_exact_mut(spec.head_dim) {
        rope_head(head, &table, spec);
    }
    Ok(())
}

/// Undo [`apply_rope`] for the same position
pub fn apply_rope_inverse(x: &mut [f32], pos: usize, spec: &RopeSpec) -> Result<()> {
    check_rope(x, spec)?;
    let table: Vec<(f32, f32)> = spec.cos_sin(pos).into_iter().map(|(c, s)| (c, -s)).collect();
    for head in x.chunks_exact_mut(spec.head_dim) {
        rope_head(head, &table, spec);
    }
    Ok(())
}

/// Head layout of one attention call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    pub fn q_dim(&self) -> usize {
        self.n_heads * self.head_dim
    }

    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// KV head serving query head `h`
    #[inline]
    pub fn kv_head(&self, h: usize) -> usize {
        h / (self.n_heads / self.n_kv_heads)
    }

    pub fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }
}

/// Numeric kernels of the LLaMA forward pass
///
/// Every method is pure in its arguments. Implementations may reorder
/// floating-point accumulation but must stay within the tolerance checked by
/// the cross-backend tests.
pub trait Kernels: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// `out[r] = dot(matrix[r], x)` for every row of a `rows x cols` matrix
    fn gemv(&self, matrix: &TensorView<'_>, x: &[f32], out: &mut [f32]) -> Result<()>;

    /// `out[i] = x[i] * weight[i] / sqrt(mean(x^2) + eps)`
    fn rmsnorm(&self, x: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) -> Result<()>;

    /// Rotate each `spec.head_dim` chunk of `x` by position `pos`
    fn rope(&self, x: &mut [f32], pos: usize, spec: &RopeSpec) -> Result<()>;

    /// `x[i] = x[i] * sigmoid(x[i])`
    fn silu(&self, x: &mut [f32]) -> Result<()>;

    /// `gate[i] = silu(gate[i]) * up[i]`
    fn silu_mul(&self, gate: &mut [f32], up: &[f32]) -> Result<()>;

    /// Numerically stable softmax in place
    fn softmax(&self, x: &mut [f32]) -> Result<()>;

    /// Causal scaled dot-product attention of one query position
    ///
    /// `keys` and `values` are laid out `[pos][kv_dim]` and must hold at
    /// least `position + 1` rows; rows after `position` are ignored.
    fn attention(
        &self,
        q: &[f32],
        keys: &[f32],
        values: &[f32],
        shape: &AttentionShape,
        position: usize,
        out: &mut [f32],
    ) -> Result<()>;
}

pub fn check_len(what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::InvalidShape(format!(
            "{}: expected {} elements, got {}",
            what, expected, actual
        )));
    }
    Ok(())
}

pub fn check_gemv(matrix: &TensorView<'_>, x: &[f32], out: &[f32]) -> Result<()> {
    check_len(&format!("gemv input for '{}'", matrix.name()), matrix.cols(), x.len())?;
    check_len(&format!("gemv output for '{}'", matrix.name()), matrix.rows(), out.len())
}

pub fn check_rmsnorm(x: &[f32], weight: &[f32], out: &[f32]) -> Result<()> {
    if x.is_empty() {
        return Err(Error::InvalidShape("rmsnorm input is empty".into()));
    }
    check_len("rmsnorm weight", x.len(), weight.len())?;
    check_len("rmsnorm output", x.len(), out.len())
}

pub fn check_rope(x: &[f32], spec: &RopeSpec) -> Result<()> {
    spec.validate()?;
    if x.len() % spec.head_dim != 0 {
        return Err(Error::InvalidShape(format!(
            "RoPE input of {} elements is not a whole number of {}-wide heads",
            x.len(),
            spec.head_dim
        )));
    }
    Ok(())
}

pub fn check_attention(
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    shape: &AttentionShape,
    position: usize,
    out: &[f32],
) -> Result<()> {
    if shape.n_heads == 0 || shape.n_kv_heads == 0 || shape.head_dim == 0 {
        return Err(Error::InvalidShape(format!("Degenerate attention shape {:?}", shape)));
    }
    if shape.n_heads % shape.n_kv_heads != 0 {
        return Err(Error::InvalidShape(format!(
            "{} query heads cannot be grouped over {} kv heads",
            shape.n_heads, shape.n_kv_heads
        )));
    }
    check_len("attention query", shape.q_dim(), q.len())?;
    check_len("attention output", shape.q_dim(), out.len())?;
    let needed = (position + 1) * shape.kv_dim();
    if keys.len() < needed || values.len() < needed {
        return Err(Error::InvalidShape(format!(
            "attention at position {} needs {} cached elements, got keys {} values {}",
            position,
            needed,
            keys.len(),
            values.len()
        )));
    }
    Ok(())
}
