//! On-disk model formats

pub mod gguf;
pub mod gguf_writer;

pub use gguf::{GGUFParser, MetadataValue, ModelMeta, ValueType};
pub use gguf_writer::GgufBuilder;
