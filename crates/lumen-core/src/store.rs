//! Tensor store: one read-only byte buffer plus the tensor catalog
//!
//! Views decode on access, so quantized matrices are never expanded unless a
//! caller asks for [`TensorView::to_f32_vec`].

use crate::error::{Error, Result};
use crate::formats::gguf::ModelMeta;
use crate::quant::{dequantize_element, dequantize_row, QK_K};
use crate::tensor::{QuantKind, TensorDesc};
use memmap2::Mmap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => m,
            Backing::Owned(v) => v,
        }
    }
}

/// Index of a tensor inside a [`TensorStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(usize);

impl TensorId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Process-unique identity of a [`TensorStore`], never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(u64);

impl StoreId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        StoreId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a store-backed view came from
///
/// Store payloads are immutable, so two views with the same origin always
/// hold the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorOrigin {
    pub store: StoreId,
    pub tensor: TensorId,
}

pub struct TensorStore {
    id: StoreId,
    backing: Backing,
    data_offset: usize,
    tensors: Vec<TensorDesc>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for TensorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorStore")
            .field("mapped", &self.is_mapped())
            .field("bytes", &self.backing.bytes().len())
            .field("tensors", &self.tensors.len())
            .finish()
    }
}

impl TensorStore {
    pub fn from_mmap(mmap: Mmap, meta: &ModelMeta) -> Result<Self> {
        Self::new(Backing::Mapped(mmap), meta)
    }

    pub fn from_bytes(bytes: Vec<u8>, meta: &ModelMeta) -> Result<Self> {
        Self::new(Backing::Owned(bytes), meta)
    }

    fn new(backing: Backing, meta: &ModelMeta) -> Result<Self> {
        let len = backing.bytes().len();
        let data_offset = usize::try_from(meta.data_offset)
            .map_err(|_| Error::Format(format!("Data offset {} too large", meta.data_offset)))?;

        let mut index = HashMap::with_capacity(meta.tensors.len());
        for (i, desc) in meta.tensors.iter().enumerate() {
            let end = usize::try_from(desc.offset)
                .ok()
                .and_then(|o| data_offset.checked_add(o))
                .and_then(|s| s.checked_add(desc.size_bytes));
            match end {
                Some(end) if end <= len => {}
                _ => {
                    return Err(Error::Format(format!(
                        "Tensor '{}' ({} bytes at data offset {}) exceeds the {} byte buffer",
                        desc.name, desc.size_bytes, desc.offset, len
                    )))
                }
            }
            index.insert(desc.name.clone(), i);
        }

        Ok(Self {
            id: StoreId::next(),
            backing,
            data_offset,
            tensors: meta.tensors.clone(),
            index,
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.id
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn descriptors(&self) -> &[TensorDesc] {
        &self.tensors
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn desc(&self, name: &str) -> Option<&TensorDesc> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    /// Resolve a name once so hot paths can skip the hash lookup
    pub fn id(&self, name: &str) -> Result<TensorId> {
        self.index.get(name).map(|&i| TensorId(i)).ok_or_else(|| Error::missing_tensor(name))
    }

    pub fn view(&self, name: &str) -> Result<TensorView<'_>> {
        Ok(self.view_by_id(self.id(name)?))
    }

    pub fn view_by_id(&self, id: TensorId) -> TensorView<'_> {
        let desc = &self.tensors[id.0];
        let start = self.data_offset + desc.offset as usize;
        TensorView {
            name: &desc.name,
            kind: desc.kind,
            rows: desc.shape.rows(),
            cols: desc.shape.cols(),
            data: &self.backing.bytes()[start..start + desc.size_bytes],
            origin: Some(TensorOrigin { store: self.id, tensor: id }),
        }
    }

    /// Total bytes of tensor payload
    pub fn payload_bytes(&self) -> usize {
        self.tensors.iter().map(|t| t.size_bytes).sum()
    }
}

/// Borrowed, typed view over one tensor, viewed as `rows x cols`
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    name: &'a str,
    kind: QuantKind,
    rows: usize,
    cols: usize,
    data: &'a [u8],
    /// `None` for views over caller-owned memory
    origin: Option<TensorOrigin>,
}

impl<'a> TensorView<'a> {
    /// Wrap a caller-owned f32 matrix (row-major, `rows x cols`)
    pub fn from_f32(name: &'a str, rows: usize, cols: usize, values: &'a [f32]) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(Error::InvalidShape(format!(
                "Tensor '{}': {} values for {}x{}",
                name,
                values.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            name,
            kind: QuantKind::F32,
            rows,
            cols,
            data: bytemuck::cast_slice(values),
            origin: None,
        })
    }

    /// Wrap encoded bytes of any kind
    pub fn from_raw(
        name: &'a str,
        kind: QuantKind,
        rows: usize,
        cols: usize,
        data: &'a [u8],
    ) -> Result<Self> {
        if cols % kind.block_size() != 0 || data.len() != rows * kind.byte_len(cols)? {
            return Err(Error::InvalidShape(format!(
                "Tensor '{}': {} bytes cannot hold {}x{} {}",
                name,
                data.len(),
                rows,
                cols,
                kind
            )));
        }
        Ok(Self { name, kind, rows, cols, data, origin: None })
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Store and tensor this view reads, if it is store-backed
    pub fn origin(&self) -> Option<TensorOrigin> {
        self.origin
    }

    pub fn kind(&self) -> QuantKind {
        self.kind
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn numel(&self) -> usize {
        self.rows * self.cols
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Zero-copy f32 slice when the payload is F32 and suitably aligned
    pub fn as_f32_slice(&self) -> Option<&'a [f32]> {
        match self.kind {
            QuantKind::F32 => bytemuck::try_cast_slice(self.data).ok(),
            _ => None,
        }
    }

    fn row_len_bytes(&self) -> usize {
        self.cols / self.kind.block_size() * self.kind.block_bytes()
    }

    pub fn row_bytes(&self, row: usize) -> Result<&'a [u8]> {
        if row >= self.rows {
            return Err(Error::InvalidArgument(format!(
                "Row {} out of range for '{}' with {} rows",
                row, self.name, self.rows
            )));
        }
        let n = self.row_len_bytes();
        Ok(&self.data[row * n..(row + 1) * n])
    }

    /// Dequantize a single element by flat index
    pub fn get(&self, index: usize) -> Result<f32> {
        if index >= self.numel() {
            return Err(Error::InvalidArgument(format!(
                "Index {} out of range for '{}' with {} elements",
                index,
                self.name,
                self.numel()
            )));
        }
        let block = self.kind.block_size();
        let bytes = self.kind.block_bytes();
        let b = index / block;
        Ok(dequantize_element(self.kind, &self.data[b * bytes..(b + 1) * bytes], index % block))
    }

    pub fn dequantize_row(&self, row: usize, out: &mut [f32]) -> Result<()> {
        if out.len() != self.cols {
            return Err(Error::InvalidShape(format!(
                "Row buffer for '{}' must hold {} values, got {}",
                self.name,
                self.cols,
                out.len()
            )));
        }
        dequantize_row(self.kind, self.row_bytes(row)?, out)
    }

    /// Dot product of one row with `x`, decoding block by block
    pub fn row_dot(&self, row: usize, x: &[f32]) -> Result<f32> {
        if x.len() != self.cols {
            return Err(Error::InvalidShape(format!(
                "Vector length {} does not match '{}' row length {}",
                x.len(),
                self.name,
                self.cols
            )));
        }
        let bytes = self.row_bytes(row)?;

        if self.kind == QuantKind::F32 {
            if let Ok(w) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
                return Ok(w.iter().zip(x).map(|(a, b)| a * b).sum());
            }
        }

        let block = self.kind.block_size();
        let block_bytes = self.kind.block_bytes();
        let mut buf = [0.0f32; QK_K];
        let mut sum = 0.0f32;
        for (blk, xs) in bytes.chunks_exact(block_bytes).zip(x.chunks_exact(block)) {
            let decoded = &mut buf[..block];
            dequantize_row(self.kind, blk, decoded)?;
            sum += decoded.iter().zip(xs).map(|(a, b)| a * b).sum::<f32>();
        }
        Ok(sum)
    }

    /// Materialize the whole tensor as f32
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; self.numel()];
        dequantize_row(self.kind, self.data, &mut out)?;
        Ok(out)
    }
}
