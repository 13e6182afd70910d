/// GGUF (GPT-Generated Unified Format) header parser
///
/// Specification: https://github.com/ggerganov/ggml/blob/master/docs/gguf.md
use crate::error::{Error, Result};
use crate::metadata::ModelMetadata;
use crate::tensor::{QuantKind, Shape, TensorDesc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

/// GGUF magic number ("GGUF" read as little-endian u32)
pub const GGUF_MAGIC: u32 = 0x4655_4747;
pub const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];
pub const DEFAULT_ALIGNMENT: u64 = 32;
/// GGML never produces tensors with more dimensions than this
pub const MAX_DIMS: usize = 4;
/// Deepest array-of-arrays nesting accepted in metadata
pub const MAX_ARRAY_DEPTH: usize = 8;

/// Wire type of a metadata value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    pub fn from_u32(id: u32) -> Result<Self> {
        Ok(match id {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            other => {
                return Err(Error::Format(format!("Unknown metadata value type: {}", other)))
            }
        })
    }

    pub fn id(self) -> u32 {
        match self {
            Self::U8 => 0,
            Self::I8 => 1,
            Self::U16 => 2,
            Self::I16 => 3,
            Self::U32 => 4,
            Self::I32 => 5,
            Self::F32 => 6,
            Self::Bool => 7,
            Self::String => 8,
            Self::Array => 9,
            Self::U64 => 10,
            Self::I64 => 11,
            Self::F64 => 12,
        }
    }

    /// Smallest encoded size of one value, used to bound counts read from the file
    fn min_size(self) -> u64 {
        match self {
            Self::U8 | Self::I8 | Self::Bool => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 | Self::String => 8,
            Self::Array => 12,
        }
    }
}

/// Typed metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<MetadataValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::U8(_) => ValueType::U8,
            Self::I8(_) => ValueType::I8,
            Self::U16(_) => ValueType::U16,
            Self::I16(_) => ValueType::I16,
            Self::U32(_) => ValueType::U32,
            Self::I32(_) => ValueType::I32,
            Self::F32(_) => ValueType::F32,
            Self::Bool(_) => ValueType::Bool,
            Self::String(_) => ValueType::String,
            Self::Array(_) => ValueType::Array,
            Self::U64(_) => ValueType::U64,
            Self::I64(_) => ValueType::I64,
            Self::F64(_) => ValueType::F64,
        }
    }

    /// Any non-negative integer, regardless of stored width
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v as u64),
            Self::U16(v) => Some(v as u64),
            Self::U32(v) => Some(v as u64),
            Self::U64(v) => Some(v),
            Self::I8(v) => u64::try_from(v).ok(),
            Self::I16(v) => u64::try_from(v).ok(),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::U8(v) => Some(v as i64),
            Self::U16(v) => Some(v as i64),
            Self::U32(v) => Some(v as i64),
            Self::U64(v) => i64::try_from(v).ok(),
            Self::I8(v) => Some(v as i64),
            Self::I16(v) => Some(v as i64),
            Self::I32(v) => Some(v as i64),
            Self::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Floats of either width; integers are widened
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F32(v) => Some(v as f64),
            Self::F64(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Everything the header describes
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub version: u32,
    pub metadata: ModelMetadata,
    pub tensors: Vec<TensorDesc>,
    /// Alignment of the data section and of every tensor offset
    pub alignment: u64,
    /// Absolute file offset of the tensor data section
    pub data_offset: u64,
    /// Total length of the underlying stream
    pub file_len: u64,
}

/// GGUF header parser
pub struct GGUFParser<R: Read + Seek> {
    reader: R,
    len: u64,
}

impl<R: Read + Seek> GGUFParser<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, len: 0 }
    }

    /// Parse the header, metadata and tensor table, and validate every tensor span
    pub fn parse_header(&mut self) -> Result<ModelMeta> {
        self.len = self.reader.seek(SeekFrom::End(0))?;
        self.reader.seek(SeekFrom::Start(0))?;

        let magic = self.read_u32()?;
        if magic != GGUF_MAGIC {
            return Err(Error::Format(format!("Invalid GGUF magic: 0x{:08X}", magic)));
        }

        let version = self.read_u32()?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(Error::Format(format!("Unsupported GGUF version: {}", version)));
        }

        let tensor_count = self.read_u64()?;
        let kv_count = self.read_u64()?;
        // key length prefix + type tag is the smallest possible entry
        self.check_count(kv_count, 12, "metadata entries")?;
        self.check_count(tensor_count, 24, "tensor descriptors")?;

        let metadata = self.parse_metadata(kv_count)?;
        let alignment = match metadata.get("general.alignment") {
            None => DEFAULT_ALIGNMENT,
            Some(v) => match v.as_u64() {
                Some(a) if a > 0 && a.is_power_of_two() => a,
                _ => {
                    return Err(Error::Format(format!("Invalid general.alignment: {:?}", v)));
                }
            },
        };

        let tensors = self.parse_tensor_info(tensor_count, alignment)?;
        let header_end = self.reader.stream_position()?;
        let data_offset = align_up(header_end, alignment);

        self.validate_spans(&tensors, data_offset)?;

        log::debug!(
            "Parsed GGUF v{}: {} metadata entries, {} tensors, data at {}",
            version,
            metadata.len(),
            tensors.len(),
            data_offset
        );

        Ok(ModelMeta { version, metadata, tensors, alignment, data_offset, file_len: self.len })
    }

    fn parse_metadata(&mut self, count: u64) -> Result<ModelMetadata> {
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = self.read_string()?;
            let value_type = ValueType::from_u32(self.read_u32()?)?;
            let value = self
                .read_value(value_type, 0)
                .map_err(|e| Error::Format(format!("Metadata key '{}': {}", key, e)))?;
            entries.push((key, value));
        }
        ModelMetadata::from_entries(entries)
    }

    /// `depth` counts the arrays enclosing this value
    fn read_value(&mut self, value_type: ValueType, depth: usize) -> Result<MetadataValue> {
        Ok(match value_type {
            ValueType::U8 => MetadataValue::U8(self.read_array::<1>()?[0]),
            ValueType::I8 => MetadataValue::I8(self.read_array::<1>()?[0] as i8),
            ValueType::U16 => MetadataValue::U16(u16::from_le_bytes(self.read_array()?)),
            ValueType::I16 => MetadataValue::I16(i16::from_le_bytes(self.read_array()?)),
            ValueType::U32 => MetadataValue::U32(self.read_u32()?),
            ValueType::I32 => MetadataValue::I32(i32::from_le_bytes(self.read_array()?)),
            ValueType::F32 => MetadataValue::F32(f32::from_le_bytes(self.read_array()?)),
            ValueType::Bool => match self.read_array::<1>()?[0] {
                0 => MetadataValue::Bool(false),
                1 => MetadataValue::Bool(true),
                other => return Err(Error::Format(format!("Invalid bool byte: {}", other))),
            },
            ValueType::String => MetadataValue::String(self.read_string()?),
            ValueType::Array => {
                if depth >= MAX_ARRAY_DEPTH {
                    return Err(Error::Format(format!(
                        "Arrays nested more than {} levels deep",
                        MAX_ARRAY_DEPTH
                    )));
                }
                let item_type = ValueType::from_u32(self.read_u32()?)?;
                let count = self.read_u64()?;
                self.check_count(count, item_type.min_size(), "array items")?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.read_value(item_type, depth + 1)?);
                }
                MetadataValue::Array(items)
            }
            ValueType::U64 => MetadataValue::U64(self.read_u64()?),
            ValueType::I64 => MetadataValue::I64(i64::from_le_bytes(self.read_array()?)),
            ValueType::F64 => MetadataValue::F64(f64::from_le_bytes(self.read_array()?)),
        })
    }

    fn parse_tensor_info(&mut self, count: u64, alignment: u64) -> Result<Vec<TensorDesc>> {
        let mut tensors = Vec::with_capacity(count as usize);
        let mut seen = HashSet::new();

        for _ in 0..count {
            let name = self.read_string()?;
            let n_dims = self.read_u32()? as usize;
            if n_dims == 0 || n_dims > MAX_DIMS {
                return Err(Error::Format(format!(
                    "Tensor '{}' has {} dimensions (1..={} supported)",
                    name, n_dims, MAX_DIMS
                )));
            }

            let mut dims = Vec::with_capacity(n_dims);
            for _ in 0..n_dims {
                let d = self.read_u64()?;
                let d = usize::try_from(d).map_err(|_| {
                    Error::Format(format!("Tensor '{}' dimension {} too large", name, d))
                })?;
                dims.push(d);
            }

            let kind = QuantKind::from_ggml(self.read_u32()?)
                .map_err(|e| Error::Format(format!("Tensor '{}': {}", name, e)))?;
            let offset = self.read_u64()?;
            if offset % alignment != 0 {
                return Err(Error::Format(format!(
                    "Tensor '{}' offset {} is not aligned to {}",
                    name, offset, alignment
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(Error::Format(format!("Duplicate tensor name: {}", name)));
            }

            log::debug!("Tensor {}: {} {:?} @ {}", name, kind, dims, offset);
            tensors.push(TensorDesc::new(name, kind, Shape::new(dims), offset)?);
        }

        Ok(tensors)
    }

    fn validate_spans(&self, tensors: &[TensorDesc], data_offset: u64) -> Result<()> {
        for desc in tensors {
            let start = data_offset.checked_add(desc.offset);
            let end = start.and_then(|s| s.checked_add(desc.size_bytes as u64));
            match end {
                Some(end) if end <= self.len => {}
                _ => {
                    let available = self.len.saturating_sub(data_offset.saturating_add(desc.offset));
                    return Err(Error::Format(format!(
                        "Tensor '{}' needs {} bytes at data offset {} but only {} remain",
                        desc.name, desc.size_bytes, desc.offset, available
                    )));
                }
            }
        }
        Ok(())
    }

    // Helper methods

    fn check_count(&mut self, count: u64, min_size: u64, what: &str) -> Result<()> {
        let pos = self.reader.stream_position()?;
        let remaining = self.len.saturating_sub(pos);
        if count.saturating_mul(min_size) > remaining {
            return Err(Error::Format(format!(
                "{} {} cannot fit in the remaining {} bytes",
                count, what, remaining
            )));
        }
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => {
                Error::Format(format!("Unexpected end of file (file is {} bytes)", self.len))
            }
            _ => Error::Io(e),
        })
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()?;
        self.check_count(len, 1, "string bytes")?;
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| Error::Format(format!("Invalid UTF-8: {}", e)))
    }
}

pub fn align_up(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}
