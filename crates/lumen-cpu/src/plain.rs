//! Reference backend: straight loops on the calling thread

use crate::kernels;
use lumen_core::error::Result;
use lumen_core::kernel::{self, AttentionShape, BackendKind, Kernels, RopeSpec};
use lumen_core::TensorView;

/// Correctness oracle for the other backends
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainBackend;

impl PlainBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Kernels for PlainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Plain
    }

    fn gemv(&self, matrix: &TensorView<'_>, x: &[f32], out: &mut [f32]) -> Result<()> {
        kernel::check_gemv(matrix, x, out)?;
        for (r, o) in out.iter_mut().enumerate() {
            *o = matrix.row_dot(r, x)?;
        }
        Ok(())
    }

    fn rmsnorm(&self, x: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) -> Result<()> {
        kernel::check_rmsnorm(x, weight, out)?;
        let scale = kernels::rms_scale(kernels::sum_squares(x), x.len(), eps);
        kernels::scale_by_weight(x, weight, scale, out);
        Ok(())
    }

    fn rope(&self, x: &mut [f32], pos: usize, spec: &RopeSpec) -> Result<()> {
        kernel::apply_rope(x, pos, spec)
    }

    fn silu(&self, x: &mut [f32]) -> Result<()> {
        kernels::silu_in_place(x);
        Ok(())
    }

    fn silu_mul(&self, gate: &mut [f32], up: &[f32]) -> Result<()> {
        kernel::check_len("silu_mul up", gate.len(), up.len())?;
        kernels::silu_mul_in_place(gate, up);
        Ok(())
    }

    fn softmax(&self, x: &mut [f32]) -> Result<()> {
        if !x.is_empty() {
            kernels::softmax_in_place(x);
        }
        Ok(())
    }

    fn attention(
        &self,
        q: &[f32],
        keys: &[f32],
        values: &[f32],
        shape: &AttentionShape,
        position: usize,
        out: &mut [f32],
    ) -> Result<()> {
        kernel::check_attention(q, keys, values, shape, position, out)?;
        let hd = shape.head_dim;
        let scale = shape.scale();
        for h in 0..shape.n_heads {
            kernels::attend_head(
                &q[h * hd..(h + 1) * hd],
                keys,
                values,
                shape.kv_dim(),
                shape.kv_head(h) * hd,
                position,
                scale,
                &mut out[h * hd..(h + 1) * hd],
            );
        }
        Ok(())
    }
}
