//! GPU backend for lumen
//!
//! Implements [`lumen_core::Kernels`] with wgpu compute shaders. Construction
//! either yields a fully initialized backend or `Error::BackendUnavailable`.

pub mod backend;

pub use backend::{GpuBackend, DEFAULT_WEIGHT_BUDGET};

/// Whether a GPU adapter can be acquired on this machine
pub fn is_available() -> bool {
    GpuBackend::new().is_ok()
}
