//! Work dispatch behind the kernel backends
//!
//! A [`Dispatcher`] decides where chunks of a kernel run. The chunking itself
//! is fixed by the caller, and reductions are combined in a fixed tree order,
//! so every dispatcher produces bit-identical results.

use lumen_core::error::Result;
use lumen_core::BackendKind;

/// Leaf width of chunked reductions
pub const REDUCE_CHUNK: usize = 256;

pub trait Dispatcher: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Worker count available to one kernel call
    fn threads(&self) -> usize;

    /// Run `f(chunk_index, chunk)` over `out.chunks_mut(chunk)`, joining before return
    fn for_each_chunk<F>(&self, out: &mut [f32], chunk: usize, f: F) -> Result<()>
    where
        F: Fn(usize, &mut [f32]) -> Result<()> + Send + Sync;

    /// `f` applied to each `chunk`-sized piece of `input`, in index order
    fn map_chunks<F>(&self, input: &[f32], chunk: usize, f: F) -> Vec<f32>
    where
        F: Fn(&[f32]) -> f32 + Send + Sync;
}

/// Pairwise sum in index order: `((p0 + p1) + (p2 + p3)) + ...`
pub fn tree_sum(mut partials: Vec<f32>) -> f32 {
    if partials.is_empty() {
        return 0.0;
    }
    while partials.len() > 1 {
        partials = partials.chunks(2).map(|p| p.iter().sum::<f32>()).collect();
    }
    partials[0]
}

/// Everything on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialDispatch;

impl Dispatcher for SequentialDispatch {
    fn kind(&self) -> BackendKind {
        BackendKind::Sequential
    }

    fn threads(&self) -> usize {
        1
    }

    fn for_each_chunk<F>(&self, out: &mut [f32], chunk: usize, f: F) -> Result<()>
    where
        F: Fn(usize, &mut [f32]) -> Result<()> + Send + Sync,
    {
        out.chunks_mut(chunk.max(1)).enumerate().try_for_each(|(i, c)| f(i, c))
    }

    fn map_chunks<F>(&self, input: &[f32], chunk: usize, f: F) -> Vec<f32>
    where
        F: Fn(&[f32]) -> f32 + Send + Sync,
    {
        input.chunks(chunk.max(1)).map(f).collect()
    }
}
