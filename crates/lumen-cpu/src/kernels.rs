//! Scalar kernel bodies shared by the CPU backends
//!
//! Callers validate shapes first; these functions index without checks.

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn sum_squares(x: &[f32]) -> f32 {
    x.iter().map(|v| v * v).sum()
}

/// Reciprocal RMS given the sum of squares of `n` values
#[inline]
pub fn rms_scale(sum_sq: f32, n: usize, eps: f32) -> f32 {
    1.0 / (sum_sq / n as f32 + eps).sqrt()
}

/// `out[i] = weight[i] * (scale * x[i])`
#[inline]
pub fn scale_by_weight(x: &[f32], weight: &[f32], scale: f32, out: &mut [f32]) {
    for ((o, &v), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = w * (scale * v);
    }
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

pub fn silu_in_place(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = silu(*v);
    }
}

pub fn silu_mul_in_place(gate: &mut [f32], up: &[f32]) {
    for (g, &u) in gate.iter_mut().zip(up) {
        *g = silu(*g) * u;
    }
}

#[inline]
pub fn max(x: &[f32]) -> f32 {
    x.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

/// Softmax: subtract max, exponentiate, normalize
pub fn softmax_in_place(x: &mut [f32]) {
    let m = max(x);
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - m).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// Attention of one query head over cached positions `0..=position`
///
/// `kv_offset` selects the kv head inside each `kv_dim`-wide cache row.
#[allow(clippy::too_many_arguments)]
pub fn attend_head(
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    kv_dim: usize,
    kv_offset: usize,
    position: usize,
    scale: f32,
    out: &mut [f32],
) {
    let head_dim = q.len();
    let mut scores: Vec<f32> = (0..=position)
        .map(|t| {
            let start = t * kv_dim + kv_offset;
            dot(q, &keys[start..start + head_dim]) * scale
        })
        .collect();
    softmax_in_place(&mut scores);

    out.fill(0.0);
    for (t, &w) in scores.iter().enumerate() {
        let start = t * kv_dim + kv_offset;
        for (o, &v) in out.iter_mut().zip(&values[start..start + head_dim]) {
            *o += w * v;
        }
    }
}
