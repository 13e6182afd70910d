//! Core building blocks for lumen
//!
//! This crate provides everything below the backends:
//! - GGUF parsing and writing
//! - Tensor store with dequantize-on-access views
//! - Quantization primitives
//! - The kernel contract every backend implements

pub mod chat;
pub mod error;
pub mod fixture;
pub mod formats;
pub mod hparams;
pub mod kernel;
pub mod loader;
pub mod metadata;
pub mod quant;
pub mod store;
pub mod tensor;
pub mod vocab;

pub use chat::{ChatFormat, Message, Role};
pub use error::{Error, Result};
pub use formats::gguf::{GGUFParser, MetadataValue, ModelMeta};
pub use formats::GgufBuilder;
pub use hparams::LlamaHparams;
pub use kernel::{AttentionShape, BackendKind, Kernels, RopeSpec, RopeStyle};
pub use loader::{load, load_from_bytes, LoadedModel};
pub use metadata::ModelMetadata;
pub use store::{StoreId, TensorId, TensorOrigin, TensorStore, TensorView};
pub use tensor::{QuantKind, Shape, TensorDesc};
pub use vocab::{SpecialTokens, TokenStyle, Vocabulary};

/// Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
