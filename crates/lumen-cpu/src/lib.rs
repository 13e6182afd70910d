//! CPU backends for lumen
//!
//! Three implementations of [`lumen_core::Kernels`]:
//! - [`PlainBackend`]: direct loops, the reference the others are checked against
//! - [`SequentialBackend`]: chunked dispatch on the calling thread
//! - [`MultithreadBackend`]: the same chunks fanned out over a rayon pool

pub mod backend;
pub mod dispatch;
pub mod kernels;
pub mod parallel;
pub mod plain;

pub use backend::{KernelBackend, MultithreadBackend, SequentialBackend};
pub use dispatch::{tree_sum, Dispatcher, SequentialDispatch, REDUCE_CHUNK};
pub use parallel::PoolDispatch;
pub use plain::PlainBackend;
