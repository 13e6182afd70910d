//! Worker-pool dispatch

use crate::dispatch::Dispatcher;
use lumen_core::error::{Error, Result};
use lumen_core::BackendKind;
use rayon::prelude::*;
use rayon::ThreadPool;

/// Fans chunks out over a private rayon pool
///
/// Each call runs inside `pool.install`, so it returns only after every
/// chunk has finished.
pub struct PoolDispatch {
    pool: ThreadPool,
}

impl PoolDispatch {
    /// `None` uses one worker per logical CPU
    pub fn new(num_threads: Option<usize>) -> Result<Self> {
        let threads = match num_threads {
            Some(0) => {
                return Err(Error::InvalidArgument("Thread count must be at least 1".into()))
            }
            Some(n) => n,
            None => num_cpus::get(),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("lumen-worker-{}", i))
            .build()
            .map_err(|e| Error::backend_unavailable(BackendKind::Multithread.name(), e))?;
        log::info!("Multithread backend using {} workers", threads);
        Ok(Self { pool })
    }
}

impl std::fmt::Debug for PoolDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDispatch").field("threads", &self.pool.current_num_threads()).finish()
    }
}

impl Dispatcher for PoolDispatch {
    fn kind(&self) -> BackendKind {
        BackendKind::Multithread
    }

    fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn for_each_chunk<F>(&self, out: &mut [f32], chunk: usize, f: F) -> Result<()>
    where
        F: Fn(usize, &mut [f32]) -> Result<()> + Send + Sync,
    {
        self.pool
            .install(|| out.par_chunks_mut(chunk.max(1)).enumerate().try_for_each(|(i, c)| f(i, c)))
    }

    fn map_chunks<F>(&self, input: &[f32], chunk: usize, f: F) -> Vec<f32>
    where
        F: Fn(&[f32]) -> f32 + Send + Sync,
    {
        self.pool.install(|| input.par_chunks(chunk.max(1)).map(f).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{tree_sum, SequentialDispatch};

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(PoolDispatch::new(Some(0)), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_reduction_independent_of_thread_count() {
        let input: Vec<f32> = (0..10_000).map(|i| ((i * 7919) % 1000) as f32 * 1e-3).collect();
        let expected = tree_sum(SequentialDispatch.map_chunks(&input, 256, |c| c.iter().sum()));
        for threads in [1, 2, 3, 8] {
            let pool = PoolDispatch::new(Some(threads)).unwrap();
            assert_eq!(pool.threads(), threads);
            let got = tree_sum(pool.map_chunks(&input, 256, |c| c.iter().sum()));
            assert_eq!(got.to_bits(), expected.to_bits(), "threads={}", threads);
        }
    }

    #[test]
    fn test_errors_propagate_from_workers() {
        let pool = PoolDispatch::new(Some(2)).unwrap();
        let mut out = vec![0.0f32; 64];
        let result = pool.for_each_chunk(&mut out, 8, |i, _| {
            if i == 5 {
                Err(Error::Runtime("chunk 5".into()))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(Error::Runtime(_))));
    }
}
