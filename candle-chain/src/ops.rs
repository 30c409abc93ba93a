//! Log-domain arithmetic used by the forward-backward recursions.
//!
//! Probabilities at the sequence lengths used in training are far outside the range of
//! `f32`/`f64`, so every sum of probabilities is taken in log space with the running maximum
//! subtracted first.

use candle::{DType, Device, Result, Tensor};

/// Shift used in place of a `-inf` maximum, so that rows with no probability mass stay `-inf`
/// instead of turning into `NaN` through `-inf - -inf`.
const MIN_LOG_SHIFT: f64 = -1e30;

/// `ln(exp(a) + exp(b))`.
///
/// `NaN` inputs propagate, `-inf` is the additive identity.
#[inline]
pub fn log_add(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    let (max, min) = if a > b { (a, b) } else { (b, a) };
    if min == f64::NEG_INFINITY {
        return max;
    }
    if max == f64::INFINITY {
        return max;
    }
    max + (min - max).exp().ln_1p()
}

/// `ln(sum(exp(xs)))` with max subtraction. Returns `-inf` for an empty slice.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let mut max = f64::NEG_INFINITY;
    for &x in xs {
        if x.is_nan() {
            return f64::NAN;
        }
        if x > max {
            max = x;
        }
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = xs.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Log-sum-exp of `xs` along `dim`, keeping the reduced dimension.
///
/// The per-row maximum is subtracted before exponentiating. `+inf` or `NaN` entries yield `NaN`
/// rows, which callers treat as a divergence signal.
pub fn log_sum_exp_keepdim(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let shift = xs.max_keepdim(dim)?.maximum(MIN_LOG_SHIFT)?;
    let sum = xs.broadcast_sub(&shift)?.exp()?.sum_keepdim(dim)?;
    sum.log()?.broadcast_add(&shift)
}

/// Splits a log-domain tensor into `(exp(xs - shift), shift)` where `shift` is the row maximum
/// along `dim`. The scaled values lie in `[0, 1]`, so products of a few of them stay in range.
pub fn exp_scaled(xs: &Tensor, dim: usize) -> Result<(Tensor, Tensor)> {
    let shift = xs.max_keepdim(dim)?.maximum(MIN_LOG_SHIFT)?;
    let scaled = xs.broadcast_sub(&shift)?.exp()?;
    Ok((scaled, shift))
}

/// Copies a tensor of any dtype/device into a host `Vec<f64>` in row-major order.
pub fn to_host_f64(xs: &Tensor) -> Result<Vec<f64>> {
    xs.flatten_all()?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()
}

/// Sum of all elements as a host `f64`.
pub fn sum_to_f64(xs: &Tensor) -> Result<f64> {
    xs.to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .sum_all()?
        .to_scalar::<f64>()
}
