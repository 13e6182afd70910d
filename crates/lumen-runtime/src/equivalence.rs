//! Cross-backend numeric comparison

use lumen_core::error::{Error, Result};

/// Check `actual` against the reference `expected` element by element
///
/// Element `i` may differ by `rel_tol * max(|expected[i]|, 1.0)`; the first
/// element outside that bound, or any NaN, is reported as
/// `Error::NumericDivergence`.
pub fn check_close(backend: &str, expected: &[f32], actual: &[f32], rel_tol: f32) -> Result<()> {
    if expected.len() != actual.len() {
        return Err(Error::InvalidShape(format!(
            "Cannot compare {} reference values with {} from '{}'",
            expected.len(),
            actual.len(),
            backend
        )));
    }
    for (index, (&e, &a)) in expected.iter().zip(actual).enumerate() {
        let tolerance = rel_tol * e.abs().max(1.0);
        let diff = (e - a).abs();
        if diff.is_nan() || diff > tolerance {
            return Err(Error::NumericDivergence {
                backend: backend.to_string(),
                index,
                expected: e,
                actual: a,
                tolerance,
            });
        }
    }
    Ok(())
}

/// Largest absolute elementwise difference
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}
