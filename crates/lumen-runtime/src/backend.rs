//! Backend selection

use crate::config::SessionConfig;
use lumen_core::error::Result;
#[cfg(not(feature = "gpu"))]
use lumen_core::error::Error;
use lumen_core::{BackendKind, Kernels};
use lumen_cpu::{MultithreadBackend, PlainBackend, SequentialBackend};
use std::sync::Arc;

/// Build the backend `config` names
///
/// Never substitutes another backend: a backend that cannot start is an
/// `Error::BackendUnavailable`.
pub fn create_backend(config: &SessionConfig) -> Result<Arc<dyn Kernels>> {
    let backend: Arc<dyn Kernels> = match config.backend {
        BackendKind::Plain => Arc::new(PlainBackend::new()),
        BackendKind::Sequential => Arc::new(SequentialBackend::new()),
        BackendKind::Multithread => Arc::new(MultithreadBackend::new(config.num_threads)?),
        BackendKind::Gpu => gpu_backend()?,
    };
    log::info!("Created {} backend", backend.name());
    Ok(backend)
}

#[cfg(feature = "gpu")]
fn gpu_backend() -> Result<Arc<dyn Kernels>> {
    Ok(Arc::new(lumen_gpu::GpuBackend::new()?))
}

#[cfg(not(feature = "gpu"))]
fn gpu_backend() -> Result<Arc<dyn Kernels>> {
    Err(Error::backend_unavailable(
        BackendKind::Gpu.name(),
        "lumen-runtime was built without the `gpu` feature",
    ))
}
