//! GGUF writer
//!
//! Produces byte images that [`GGUFParser`](super::GGUFParser) and external
//! GGUF readers accept. Used to build fixture models.

use super::gguf::{align_up, MetadataValue, ValueType, DEFAULT_ALIGNMENT, GGUF_MAGIC};
use crate::error::{Error, Result};
use crate::quant::quantize;
use crate::tensor::{QuantKind, Shape, TensorDesc};
use std::path::Path;

struct PendingTensor {
    desc: TensorDesc,
    data: Vec<u8>,
}

/// Incremental GGUF image builder
pub struct GgufBuilder {
    version: u32,
    alignment: u64,
    metadata: Vec<(String, MetadataValue)>,
    tensors: Vec<PendingTensor>,
}

impl Default for GgufBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GgufBuilder {
    pub fn new() -> Self {
        Self { version: 3, alignment: DEFAULT_ALIGNMENT, metadata: Vec::new(), tensors: Vec::new() }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Non-default alignment is recorded as `general.alignment`
    pub fn alignment(mut self, alignment: u64) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() || alignment > u32::MAX as u64 {
            return Err(Error::InvalidArgument(format!("Invalid alignment {}", alignment)));
        }
        self.alignment = alignment;
        self.metadata.retain(|(k, _)| k != "general.alignment");
        self.metadata.push(("general.alignment".into(), MetadataValue::U32(alignment as u32)));
        Ok(self)
    }

    pub fn metadata(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    pub fn string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata(key, MetadataValue::String(value.into()))
    }

    pub fn u32(self, key: impl Into<String>, value: u32) -> Self {
        self.metadata(key, MetadataValue::U32(value))
    }

    pub fn f32(self, key: impl Into<String>, value: f32) -> Self {
        self.metadata(key, MetadataValue::F32(value))
    }

    /// Add a tensor from f32 values, encoding it as `kind`
    ///
    /// `dims` are in file order: `dims[0]` is the row length.
    pub fn tensor(self, name: &str, dims: &[usize], kind: QuantKind, values: &[f32]) -> Result<Self> {
        let shape = Shape::new(dims.to_vec());
        if shape.numel() != values.len() {
            return Err(Error::InvalidShape(format!(
                "Tensor '{}' has shape {} but {} values",
                name,
                shape,
                values.len()
            )));
        }
        let data = quantize(kind, values)?;
        self.raw_tensor(name, dims, kind, data)
    }

    /// Add a tensor whose payload is already encoded
    pub fn raw_tensor(
        mut self,
        name: &str,
        dims: &[usize],
        kind: QuantKind,
        data: Vec<u8>,
    ) -> Result<Self> {
        let desc = TensorDesc::new(name.to_string(), kind, Shape::new(dims.to_vec()), 0)?;
        if desc.size_bytes != data.len() {
            return Err(Error::InvalidShape(format!(
                "Tensor '{}' expects {} bytes, got {}",
                name,
                desc.size_bytes,
                data.len()
            )));
        }
        self.tensors.push(PendingTensor { desc, data });
        Ok(self)
    }

    /// Serialize header, metadata, tensor table and aligned payloads
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        for (key, value) in &self.metadata {
            write_string(&mut out, key);
            out.extend_from_slice(&value.value_type().id().to_le_bytes());
            write_value(&mut out, value)?;
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            offset = align_up(offset, self.alignment);
            offsets.push(offset);
            write_string(&mut out, &t.desc.name);
            out.extend_from_slice(&(t.desc.shape.ndim() as u32).to_le_bytes());
            for &d in t.desc.shape.dims() {
                out.extend_from_slice(&(d as u64).to_le_bytes());
            }
            out.extend_from_slice(&t.desc.kind.ggml_id().to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            offset += t.data.len() as u64;
        }

        let data_start = align_up(out.len() as u64, self.alignment) as usize;
        out.resize(data_start, 0);
        for (t, off) in self.tensors.iter().zip(offsets) {
            out.resize(data_start + off as usize, 0);
            out.extend_from_slice(&t.data);
        }
        Ok(out)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.build()?)?;
        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_value(out: &mut Vec<u8>, value: &MetadataValue) -> Result<()> {
    match value {
        MetadataValue::U8(v) => out.push(*v),
        MetadataValue::I8(v) => out.push(*v as u8),
        MetadataValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetadataValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetadataValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetadataValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetadataValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetadataValue::Bool(v) => out.push(*v as u8),
        MetadataValue::String(s) => write_string(out, s),
        MetadataValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetadataValue::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetadataValue::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        MetadataValue::Array(items) => {
            let item_type = items.first().map(|v| v.value_type()).unwrap_or(ValueType::U32);
            if items.iter().any(|v| v.value_type() != item_type) {
                return Err(Error::InvalidArgument("Metadata arrays must be homogeneous".into()));
            }
            out.extend_from_slice(&item_type.id().to_le_bytes());
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_value(out, item)?;
            }
        }
    }
    Ok(())
}
