//! Quantization and dequantization primitives
//!
//! All decoders work on raw little-endian block bytes as they appear in a
//! GGUF data section, so they can run directly over a memory-mapped file.

use crate::error::{Error, Result};
use crate::tensor::QuantKind;
use half::f16;

/// Block size for 32-element quantization kinds
pub const QK: usize = 32;
/// K-quants use 256-element super-blocks
pub const QK_K: usize = 256;

#[inline]
fn read_f16(bytes: &[u8], at: usize) -> f32 {
    f16::from_le_bytes([bytes[at], bytes[at + 1]]).to_f32()
}

#[inline]
fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Extract the 6-bit scale and min of sub-block `j` from a Q4_K scales array
#[inline]
pub fn get_scale_min_k4(j: usize, scales: &[u8]) -> (u8, u8) {
    if j < 4 {
        (scales[j] & 63, scales[j + 4] & 63)
    } else {
        (
            (scales[j + 4] & 0xF) | ((scales[j - 4] >> 6) << 4),
            (scales[j + 4] >> 4) | ((scales[j] >> 6) << 4),
        )
    }
}

fn check_block(kind: QuantKind, block: &[u8], out_len: usize) -> Result<()> {
    if block.len() != kind.block_bytes() {
        return Err(Error::InvalidShape(format!(
            "{} block must be {} bytes, got {}",
            kind,
            kind.block_bytes(),
            block.len()
        )));
    }
    if out_len != kind.block_size() {
        return Err(Error::InvalidShape(format!(
            "Output buffer must be {} elements, got {}",
            kind.block_size(),
            out_len
        )));
    }
    Ok(())
}

/// Dequantize one block of `kind` into `output` (`kind.block_size()` values)
pub fn dequantize_block(kind: QuantKind, block: &[u8], output: &mut [f32]) -> Result<()> {
    check_block(kind, block, output.len())?;
    match kind {
        QuantKind::F32 => output[0] = read_f32(block, 0),
        QuantKind::F16 => output[0] = read_f16(block, 0),
        QuantKind::Q4_0 => dequantize_q4_0(block, output),
        QuantKind::Q4_1 => dequantize_q4_1(block, output),
        QuantKind::Q8_0 => dequantize_q8_0(block, output),
        QuantKind::Q4_K => dequantize_q4_k(block, output),
        QuantKind::Q6_K => dequantize_q6_k(block, output),
    }
    Ok(())
}

/// Dequantize a run of whole blocks (typically one matrix row)
pub fn dequantize_row(kind: QuantKind, bytes: &[u8], output: &mut [f32]) -> Result<()> {
    let block = kind.block_size();
    let block_bytes = kind.block_bytes();
    if output.len() % block != 0 || bytes.len() != output.len() / block * block_bytes {
        return Err(Error::InvalidShape(format!(
            "Cannot decode {} bytes of {} into {} values",
            bytes.len(),
            kind,
            output.len()
        )));
    }
    match kind {
        QuantKind::F32 => {
            for (o, chunk) in output.iter_mut().zip(bytes.chunks_exact(4)) {
                *o = read_f32(chunk, 0);
            }
        }
        QuantKind::F16 => {
            for (o, chunk) in output.iter_mut().zip(bytes.chunks_exact(2)) {
                *o = read_f16(chunk, 0);
            }
        }
        _ => {
            for (out, blk) in output.chunks_exact_mut(block).zip(bytes.chunks_exact(block_bytes)) {
                dequantize_block(kind, blk, out)?;
            }
        }
    }
    Ok(())
}

/// Decode element `i` (0-based within its block) without touching the rest of the block
pub fn dequantize_element(kind: QuantKind, block: &[u8], i: usize) -> f32 {
    match kind {
        QuantKind::F32 => read_f32(block, 0),
        QuantKind::F16 => read_f16(block, 0),
        QuantKind::Q4_0 => {
            let d = read_f16(block, 0);
            d * (nibble(&block[2..18], i) as f32 - 8.0)
        }
        QuantKind::Q4_1 => {
            let d = read_f16(block, 0);
            let m = read_f16(block, 2);
            d * nibble(&block[4..20], i) as f32 + m
        }
        QuantKind::Q8_0 => read_f16(block, 0) * (block[2 + i] as i8) as f32,
        QuantKind::Q4_K => {
            let d = read_f16(block, 0);
            let dmin = read_f16(block, 2);
            let scales = &block[4..16];
            let qs = &block[16..144];
            let group = i / 64;
            let within = i % 64;
            let (sc, m) = get_scale_min_k4(2 * group + within / 32, scales);
            let byte = qs[group * 32 + within % 32];
            let q = if within < 32 { byte & 0xF } else { byte >> 4 };
            d * sc as f32 * q as f32 - dmin * m as f32
        }
        QuantKind::Q6_K => {
            let ql = &block[0..128];
            let qh = &block[128..192];
            let scales = &block[192..208];
            let d = read_f16(block, 208);
            let half = i / 128;
            let quad = (i % 128) / 32;
            let l = i % 32;
            let low = ql[64 * half + l + 32 * (quad & 1)];
            let low = if quad < 2 { low & 0xF } else { low >> 4 };
            let high = (qh[32 * half + l] >> (2 * quad)) & 3;
            let q = (low | (high << 4)) as i32 - 32;
            let sc = scales[8 * half + l / 16 + 2 * quad] as i8;
            d * sc as f32 * q as f32
        }
    }
}

/// Code `i` of a 32-element nibble block: low nibbles first, then high nibbles
#[inline]
fn nibble(qs: &[u8], i: usize) -> u8 {
    if i < QK / 2 {
        qs[i] & 0x0F
    } else {
        qs[i - QK / 2] >> 4
    }
}

fn dequantize_q4_0(block: &[u8], output: &mut [f32]) {
    let d = read_f16(block, 0);
    let qs = &block[2..18];
    // Low nibbles fill the first half of the block, high nibbles the second half.
    for (j, &byte) in qs.iter().enumerate() {
        output[j] = ((byte & 0x0F) as f32 - 8.0) * d;
        output[j + QK / 2] = ((byte >> 4) as f32 - 8.0) * d;
    }
}

fn dequantize_q4_1(block: &[u8], output: &mut [f32]) {
    let d = read_f16(block, 0);
    let m = read_f16(block, 2);
    let qs = &block[4..20];
    for (j, &byte) in qs.iter().enumerate() {
        output[j] = (byte & 0x0F) as f32 * d + m;
        output[j + QK / 2] = (byte >> 4) as f32 * d + m;
    }
}

fn dequantize_q8_0(block: &[u8], output: &mut [f32]) {
    let d = read_f16(block, 0);
    for (o, &q) in output.iter_mut().zip(&block[2..2 + QK]) {
        *o = (q as i8) as f32 * d;
    }
}

fn dequantize_q4_k(block: &[u8], output: &mut [f32]) {
    let d = read_f16(block, 0);
    let min = read_f16(block, 2);
    let scales = &block[4..16];
    let qs = &block[16..144];

    // 256 elements in 4 groups of 64; each group has two 32-value sub-blocks
    for i in 0..4 {
        let (sc, m) = get_scale_min_k4(2 * i, scales);
        let d1 = d * sc as f32;
        let m1 = min * m as f32;
        let (sc, m) = get_scale_min_k4(2 * i + 1, scales);
        let d2 = d * sc as f32;
        let m2 = min * m as f32;

        let q = &qs[i * 32..i * 32 + 32];
        let y = &mut output[i * 64..i * 64 + 64];
        for j in 0..32 {
            y[j] = d1 * (q[j] & 0xF) as f32 - m1;
            y[j + 32] = d2 * (q[j] >> 4) as f32 - m2;
        }
    }
}

fn dequantize_q6_k(block: &[u8], output: &mut [f32]) {
    let ql = &block[0..128];
    let qh = &block[128..192];
    let scales = &block[192..208];
    let d = read_f16(block, 208);

    for half in 0..2 {
        let ql = &ql[64 * half..];
        let qh = &qh[32 * half..];
        let sc = &scales[8 * half..];
        let y = &mut output[128 * half..128 * half + 128];
        for l in 0..32 {
            let is = l / 16;
            let q1 = ((ql[l] & 0xF) | ((qh[l] & 3) << 4)) as i32 - 32;
            let q2 = ((ql[l + 32] & 0xF) | (((qh[l] >> 2) & 3) << 4)) as i32 - 32;
            let q3 = ((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) as i32 - 32;
            let q4 = ((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) as i32 - 32;
            y[l] = d * (sc[is] as i8) as f32 * q1 as f32;
            y[l + 32] = d * (sc[is + 2] as i8) as f32 * q2 as f32;
            y[l + 64] = d * (sc[is + 4] as i8) as f32 * q3 as f32;
            y[l + 96] = d * (sc[is + 6] as i8) as f32 * q4 as f32;
        }
    }
}

/// Encode f32 values into the byte layout of `kind`.
///
/// Supports the plain float kinds plus Q8_0, Q4_0 and Q4_1, using the
/// reference GGML rounding. K-quants are decode-only.
pub fn quantize(kind: QuantKind, values: &[f32]) -> Result<Vec<u8>> {
    let block = kind.block_size();
    if values.len() % block != 0 {
        return Err(Error::InvalidShape(format!(
            "{} values is not a multiple of the {} block size {}",
            values.len(),
            kind,
            block
        )));
    }
    let mut out = Vec::with_capacity(values.len() / block * kind.block_bytes());
    match kind {
        QuantKind::F32 => out.extend_from_slice(bytemuck::cast_slice(values)),
        QuantKind::F16 => {
            for &v in values {
                out.extend_from_slice(&f16::from_f32(v).to_le_bytes());
            }
        }
        QuantKind::Q8_0 => {
            for chunk in values.chunks_exact(QK) {
                let amax = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
                let d = amax / 127.0;
                let id = if d != 0.0 { 1.0 / d } else { 0.0 };
                out.extend_from_slice(&f16::from_f32(d).to_le_bytes());
                out.extend(chunk.iter().map(|&v| (v * id).round() as i8 as u8));
            }
        }
        QuantKind::Q4_0 => {
            for chunk in values.chunks_exact(QK) {
                // Signed value with the largest magnitude maps to -8.
                let max = chunk.iter().fold(0.0f32, |m, &v| if v.abs() > m.abs() { v } else { m });
                let d = max / -8.0;
                let id = if d != 0.0 { 1.0 / d } else { 0.0 };
                out.extend_from_slice(&f16::from_f32(d).to_le_bytes());
                for j in 0..QK / 2 {
                    let lo = ((chunk[j] * id + 8.5) as i8).clamp(0, 15) as u8;
                    let hi = ((chunk[j + QK / 2] * id + 8.5) as i8).clamp(0, 15) as u8;
                    out.push(lo | (hi << 4));
                }
            }
        }
        QuantKind::Q4_1 => {
            for chunk in values.chunks_exact(QK) {
                let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
                let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let d = (max - min) / 15.0;
                let id = if d != 0.0 { 1.0 / d } else { 0.0 };
                out.extend_from_slice(&f16::from_f32(d).to_le_bytes());
                out.extend_from_slice(&f16::from_f32(min).to_le_bytes());
                for j in 0..QK / 2 {
                    let lo = (((chunk[j] - min) * id + 0.5) as u8).min(15);
                    let hi = (((chunk[j + QK / 2] - min) * id + 0.5) as u8).min(15);
                    out.push(lo | (hi << 4));
                }
            }
        }
        QuantKind::Q4_K | QuantKind::Q6_K => {
            return Err(Error::UnsupportedDataType(format!(
                "Quantizing to {} is not supported",
                kind
            )))
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f16_bytes(v: f32) -> [u8; 2] {
        f16::from_f32(v).to_le_bytes()
    }

    #[test]
    fn test_q4_0_dequant() {
        let mut block = Vec::new();
        block.extend_from_slice(&f16_bytes(0.5));
        block.extend_from_slice(&[0x1Fu8; 16]); // low nibble 15, high nibble 1

        let mut output = [0.0f32; QK];
        dequantize_block(QuantKind::Q4_0, &block, &mut output).unwrap();

        assert_eq!(output[0], (15.0 - 8.0) * 0.5);
        assert_eq!(output[16], (1.0 - 8.0) * 0.5);
        assert_eq!(dequantize_element(QuantKind::Q4_0, &block, 3), output[3]);
        assert_eq!(dequantize_element(QuantKind::Q4_0, &block, 20), output[20]);
    }

    #[test]
    fn test_q4_1_has_offset() {
        let mut block = Vec::new();
        block.extend_from_slice(&f16_bytes(0.25));
        block.extend_from_slice(&f16_bytes(-1.0));
        block.extend_from_slice(&[0x40u8; 16]);

        let mut output = [0.0f32; QK];
        dequantize_block(QuantKind::Q4_1, &block, &mut output).unwrap();
        assert_eq!(output[0], -1.0);
        assert_eq!(output[16], 4.0 * 0.25 - 1.0);
    }

    #[test]
    fn test_q8_dequant() {
        let mut block = Vec::new();
        block.extend_from_slice(&f16_bytes(0.25));
        block.extend((0..32).map(|i| (i as i8 - 16) as u8));

        let mut output = [0.0f32; QK];
        dequantize_block(QuantKind::Q8_0, &block, &mut output).unwrap();
        assert_eq!(output[0], -16.0 * 0.25);
        assert_eq!(output[31], 15.0 * 0.25);
        for i in 0..QK {
            assert_eq!(dequantize_element(QuantKind::Q8_0, &block, i), output[i]);
        }
    }

    #[test]
    fn test_q4_k_element_matches_block() {
        let mut block = vec![0u8; 144];
        block[0..2].copy_from_slice(&f16_bytes(0.5));
        block[2..4].copy_from_slice(&f16_bytes(0.125));
        for (i, b) in block[4..16].iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37) ^ 0xA5;
        }
        for (i, b) in block[16..].iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(29);
        }

        let mut output = [0.0f32; QK_K];
        dequantize_block(QuantKind::Q4_K, &block, &mut output).unwrap();
        assert!(output.iter().all(|v| v.is_finite()));
        for i in 0..QK_K {
            assert_eq!(dequantize_element(QuantKind::Q4_K, &block, i), output[i], "index {}", i);
        }
    }

    #[test]
    fn test_q6_k_element_matches_block() {
        let mut block = vec![0u8; 210];
        for (i, b) in block[..192].iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(73).wrapping_add(11);
        }
        for (i, b) in block[192..208].iter_mut().enumerate() {
            *b = (i as i8 - 8) as u8;
        }
        block[208..210].copy_from_slice(&f16_bytes(0.0625));

        let mut output = [0.0f32; QK_K];
        dequantize_block(QuantKind::Q6_K, &block, &mut output).unwrap();
        for i in 0..QK_K {
            assert_eq!(dequantize_element(QuantKind::Q6_K, &block, i), output[i], "index {}", i);
        }
    }

    #[test]
    fn test_q6_k_known_value() {
        let mut block = vec![0u8; 210];
        block[0] = 0x05; // element 0 low nibble
        block[128] = 0x02; // element 0 high bits -> q = 5 | 32 = 37
        block[192] = 3; // scale of sub-block 0
        block[208..210].copy_from_slice(&f16_bytes(1.0));

        assert_eq!(dequantize_element(QuantKind::Q6_K, &block, 0), 3.0 * (37.0 - 32.0));
        // untouched elements decode to d * sc * (0 - 32)
        assert_eq!(dequantize_element(QuantKind::Q6_K, &block, 1), 3.0 * -32.0);
    }

    #[test]
    fn test_quantize_q8_0_error_bound() {
        let values: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        let bytes = quantize(QuantKind::Q8_0, &values).unwrap();
        assert_eq!(bytes.len(), 2 * 34);

        let mut decoded = vec![0.0f32; 64];
        dequantize_row(QuantKind::Q8_0, &bytes, &mut decoded).unwrap();
        for (a, b) in values.iter().zip(&decoded) {
            assert!((a - b).abs() < 1.0 / 127.0 + 1e-3);
        }
    }

    #[test]
    fn test_quantize_q4_0_error_bound() {
        let values: Vec<f32> = (0..32).map(|i| i as f32 / 8.0 - 2.0).collect();
        let bytes = quantize(QuantKind::Q4_0, &values).unwrap();
        let mut decoded = vec![0.0f32; 32];
        dequantize_row(QuantKind::Q4_0, &bytes, &mut decoded).unwrap();
        // step is |max| / 8 = 0.25, so rounding error stays within half a step
        for (a, b) in values.iter().zip(&decoded) {
            assert!((a - b).abs() <= 0.126, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_wrong_block_length() {
        let mut output = [0.0f32; QK];
        let err = dequantize_block(QuantKind::Q8_0, &[0u8; 33], &mut output).unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)));
    }
}
