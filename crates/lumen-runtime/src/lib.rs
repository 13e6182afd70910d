//! lumen runtime
//!
//! Builds a kernel backend from a [`SessionConfig`] and runs LLaMA decoding
//! sessions over a loaded model: KV cache, weight resolution, the per-token
//! forward pass and sampling.

pub mod activations;
pub mod backend;
pub mod config;
pub mod equivalence;
pub mod kv_cache;
pub mod sampling;
pub mod session;
pub mod weights;

pub use backend::create_backend;
pub use config::{GenerationConfig, SessionConfig, WeightStorage};
pub use equivalence::check_close;
pub use kv_cache::KVCache;
pub use sampling::{argmax, LogitsProcessor, Sampling};
pub use session::InferenceSession;
pub use weights::WeightCache;

pub use lumen_core::{BackendKind, Error, Result};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
