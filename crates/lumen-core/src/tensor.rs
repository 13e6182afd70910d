use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage kind of a tensor payload, numbered as in the GGML type table
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantKind {
    F32,
    F16,
    /// 32 4-bit codes, f16 scale, implicit zero point of 8
    Q4_0,
    /// 32 4-bit codes, f16 scale and f16 offset
    Q4_1,
    /// 32 signed 8-bit codes, f16 scale
    Q8_0,
    /// 256-element super-block, 6-bit sub-block scales and mins
    Q4_K,
    /// 256-element super-block, 6-bit codes, 8-bit sub-block scales
    Q6_K,
}

impl QuantKind {
    pub const ALL: [QuantKind; 7] = [
        QuantKind::F32,
        QuantKind::F16,
        QuantKind::Q4_0,
        QuantKind::Q4_1,
        QuantKind::Q8_0,
        QuantKind::Q4_K,
        QuantKind::Q6_K,
    ];

    pub fn from_ggml(id: u32) -> Result<Self> {
        match id {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            2 => Ok(Self::Q4_0),
            3 => Ok(Self::Q4_1),
            8 => Ok(Self::Q8_0),
            12 => Ok(Self::Q4_K),
            14 => Ok(Self::Q6_K),
            other => Err(Error::Format(format!("Unsupported tensor type id: {}", other))),
        }
    }

    pub fn ggml_id(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q8_0 => 8,
            Self::Q4_K => 12,
            Self::Q6_K => 14,
        }
    }

    /// Elements per block (1 for plain floats)
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q8_0 => 32,
            Self::Q4_K | Self::Q6_K => 256,
        }
    }

    /// Bytes per block
    pub fn block_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => 18,
            Self::Q4_1 => 20,
            Self::Q8_0 => 34,
            Self::Q4_K => 144,
            Self::Q6_K => 210,
        }
    }

    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16)
    }

    /// Whether decoded values carry an additive offset term
    pub fn has_offset(self) -> bool {
        matches!(self, Self::Q4_1 | Self::Q4_K)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::Q4_0 => "Q4_0",
            Self::Q4_1 => "Q4_1",
            Self::Q8_0 => "Q8_0",
            Self::Q4_K => "Q4_K",
            Self::Q6_K => "Q6_K",
        }
    }

    /// Byte length of `numel` elements; fails when `numel` is not block aligned
    pub fn byte_len(self, numel: usize) -> Result<usize> {
        let block = self.block_size();
        if numel % block != 0 {
            return Err(Error::Format(format!(
                "{} elements is not a multiple of the {} block size {}",
                numel,
                self.name(),
                block
            )));
        }
        (numel / block)
            .checked_mul(self.block_bytes())
            .ok_or_else(|| Error::Format(format!("{} tensor of {} elements overflows", self, numel)))
    }
}

impl fmt::Display for QuantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tensor shape in file order: `dims[0]` is the contiguous dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Length of one row (the contiguous dimension)
    pub fn cols(&self) -> usize {
        self.0.first().copied().unwrap_or(1)
    }

    /// Number of rows when viewed as a 2-D matrix
    pub fn rows(&self) -> usize {
        self.0.iter().skip(1).product()
    }

    /// Validates shape dimensions
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidShape("Shape cannot be empty".into()));
        }
        if self.0.contains(&0) {
            return Err(Error::InvalidShape("Shape dimensions must be > 0".into()));
        }
        if self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(Error::InvalidShape(format!("Shape {:?} overflows usize", self.0)));
        }
        Ok(())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Location and layout of one tensor inside the data section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    /// Tensor name (e.g., "blk.0.attn_q.weight")
    pub name: String,
    pub kind: QuantKind,
    pub shape: Shape,
    /// Offset relative to the start of the data section
    pub offset: u64,
    /// Byte length, derived from shape and kind
    pub size_bytes: usize,
}

impl TensorDesc {
    pub fn new(name: String, kind: QuantKind, shape: Shape, offset: u64) -> Result<Self> {
        shape.validate().map_err(|e| Error::Format(format!("Tensor '{}': {}", name, e)))?;

        // Rows must start on a block boundary for row-wise decoding.
        if shape.cols() % kind.block_size() != 0 {
            return Err(Error::Format(format!(
                "Tensor '{}': row length {} is not a multiple of the {} block size {}",
                name,
                shape.cols(),
                kind,
                kind.block_size()
            )));
        }
        let size_bytes = kind
            .byte_len(shape.numel())
            .map_err(|e| Error::Format(format!("Tensor '{}': {}", name, e)))?;

        Ok(Self { name, kind, shape, offset, size_bytes })
    }

    pub fn element_count(&self) -> usize {
        self.shape.numel()
    }

    /// Bytes occupied by one row
    pub fn row_bytes(&self) -> usize {
        self.shape.cols() / self.kind.block_size() * self.kind.block_bytes()
    }
}
