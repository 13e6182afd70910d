//! Dispatcher-driven kernel backend
//!
//! One implementation of [`Kernels`] serves both the sequential and the
//! multithreaded strategies. Work is split into fixed-size chunks that do
//! not depend on the worker count, and every reduction goes through
//! [`tree_sum`], so the two produce identical bits.

use crate::dispatch::{tree_sum, Dispatcher, SequentialDispatch, REDUCE_CHUNK};
use crate::kernels;
use crate::parallel::PoolDispatch;
use lumen_core::error::Result;
use lumen_core::kernel::{self, rope_head, AttentionShape, BackendKind, Kernels, RopeSpec};
use lumen_core::TensorView;

/// Output rows handed to one task in `gemv`
pub const ROWS_PER_TASK: usize = 16;

/// Elements per task for elementwise kernels
const ELEMENTWISE_CHUNK: usize = 4096;

#[derive(Debug)]
pub struct KernelBackend<D: Dispatcher> {
    dispatch: D,
}

pub type SequentialBackend = KernelBackend<SequentialDispatch>;
pub type MultithreadBackend = KernelBackend<PoolDispatch>;

impl<D: Dispatcher> KernelBackend<D> {
    pub fn with_dispatcher(dispatch: D) -> Self {
        Self { dispatch }
    }

    pub fn threads(&self) -> usize {
        self.dispatch.threads()
    }

    fn chunked_sum<F>(&self, x: &[f32], f: F) -> f32
    where
        F: Fn(&[f32]) -> f32 + Send + Sync,
    {
        tree_sum(self.dispatch.map_chunks(x, REDUCE_CHUNK, f))
    }
}

impl SequentialBackend {
    pub fn new() -> Self {
        Self::with_dispatcher(SequentialDispatch)
    }
}

impl Default for SequentialBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MultithreadBackend {
    /// `None` sizes the pool to the number of logical CPUs
    pub fn new(num_threads: Option<usize>) -> Result<Self> {
        Ok(Self::with_dispatcher(PoolDispatch::new(num_threads)?))
    }
}

impl<D: Dispatcher> Kernels for KernelBackend<D> {
    fn kind(&self) -> BackendKind {
        self.dispatch.kind()
    }

    fn gemv(&self, matrix: &TensorView<'_>, x: &[f32], out: &mut [f32]) -> Result<()> {
        kernel::check_gemv(matrix, x, out)?;
        self.dispatch.for_each_chunk(out, ROWS_PER_TASK, |task, rows| {
            let first = task * ROWS_PER_TASK;
            for (i, o) in rows.iter_mut().enumerate() {
                *o = matrix.row_dot(first + i, x)?;
            }
            Ok(())
        })
    }

    fn rmsnorm(&self, x: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) -> Result<()> {
        kernel::check_rmsnorm(x, weight, out)?;
        let scale = kernels::rms_scale(self.chunked_sum(x, kernels::sum_squares), x.len(), eps);
        self.dispatch.for_each_chunk(out, REDUCE_CHUNK, |task, chunk| {
            let start = task * REDUCE_CHUNK;
            let end = start + chunk.len();
            kernels::scale_by_weight(&x[start..end], &weight[start..end], scale, chunk);
            Ok(())
        })
    }

    fn rope(&self, x: &mut [f32], pos: usize, spec: &RopeSpec) -> Result<()> {
        kernel::check_rope(x, spec)?;
        let table = spec.cos_sin(pos);
        self.dispatch.for_each_chunk(x, spec.head_dim, |_, head| {
            rope_head(head, &table, spec);
            Ok(())
        })
    }

    fn silu(&self, x: &mut [f32]) -> Result<()> {
        self.dispatch.for_each_chunk(x, ELEMENTWISE_CHUNK, |_, chunk| {
            kernels::silu_in_place(chunk);
            Ok(())
        })
    }

    fn silu_mul(&self, gate: &mut [f32], up: &[f32]) -> Result<()> {
        kernel::check_len("silu_mul up", gate.len(), up.len())?;
        self.dispatch.for_each_chunk(gate, ELEMENTWISE_CHUNK, |task, chunk| {
            let start = task * ELEMENTWISE_CHUNK;
            kernels::silu_mul_in_place(chunk, &up[start..start + chunk.len()]);
            Ok(())
        })
    }

    fn softmax(&self, x: &mut [f32]) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        let m = self.dispatch.map_chunks(x, REDUCE_CHUNK, kernels::max);
        let m = kernels::max(&m);
        self.dispatch.for_each_chunk(x, REDUCE_CHUNK, |_, chunk| {
            for v in chunk.iter_mut() {
                *v = (*v - m).exp();
            }
            Ok(())
        })?;
        let sum = self.chunked_sum(x, |c| c.iter().sum());
        self.dispatch.for_each_chunk(x, REDUCE_CHUNK, |_, chunk| {
            for v in chunk.iter_mut() {
                *v /= sum;
            }
            Ok(())
        })
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
        self.dispatch.for_each_chunk(out, hd, |h, head_out| {
            kernels::attend_head(
                &q[h * hd..(h + 1) * hd],
                keys,
                values,
                shape.kv_dim(),
                shape.kv_head(h) * hd,
                position,
                scale,
                head_out,
            );
            Ok(())
        })
    }
}
