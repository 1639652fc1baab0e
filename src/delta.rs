//! Low-rank delta computation.
//!
//! An adapter patches a weight `W [out, in]` by
//!
//! ```text
//! ΔW = scale · up × down            up [out, r], down [r, in]
//! ΔW = scale · up × mid × down      mid [r1, r2] (LoCon-style)
//! scale = alpha / rank · strength   (strength alone when alpha is absent)
//! ```

use candle_core::Tensor;

use crate::error::{ComposeError, Result};
use crate::store::AdapterFactors;

/// Association order for the three-factor product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulOrder {
    /// `up × (mid × down)`, intermediate `[r_up, in]`.
    MidThenDown,
    /// `(up × mid) × down`, intermediate `[out, rank]`.
    UpThenMid,
}

/// Effective scale of one adapter at `strength`.
///
/// # Errors
/// Returns `InvalidConfig` if the result is not finite.
#[allow(clippy::cast_precision_loss)]
pub fn scale(factors: &AdapterFactors, strength: f32) -> Result<f32> {
    let scale = match factors.alpha() {
        Some(alpha) => alpha / factors.rank() as f32 * strength,
        None => strength,
    };
    if scale.is_finite() {
        Ok(scale)
    } else {
        Err(ComposeError::InvalidConfig(format!(
            "non-finite adapter scale (alpha {:?}, rank {}, strength {strength})",
            factors.alpha(),
            factors.rank()
        )))
    }
}

/// Pick the association order with the smaller intermediate product.
///
/// Without a mid factor there is only one product and `MidThenDown` is returned.
#[must_use]
pub fn choose_order(factors: &AdapterFactors) -> MatmulOrder {
    let Some(mid) = factors.mid() else {
        return MatmulOrder::MidThenDown;
    };
    let mid_down = mid.dims()[0] * factors.in_features();
    let up_mid = factors.out_features() * factors.rank();
    if up_mid < mid_down {
        MatmulOrder::UpThenMid
    } else {
        MatmulOrder::MidThenDown
    }
}

/// Unscaled dense product `up × [mid ×] down`, shape `[out, in]`.
///
/// # Errors
/// Returns error if a matmul fails.
pub fn dense_product(factors: &AdapterFactors) -> Result<Tensor> {
    let product = match factors.mid() {
        None => factors.up().matmul(factors.down())?,
        Some(mid) => match choose_order(factors) {
            MatmulOrder::MidThenDown => factors.up().matmul(&mid.matmul(factors.down())?)?,
            MatmulOrder::UpThenMid => factors.up().matmul(mid)?.matmul(factors.down())?,
        },
    };
    Ok(product)
}

/// Dense correction for one adapter, reshaped to `target_shape`.
///
/// # Errors
/// Returns `ShapeMismatch` if the product's element count differs from
/// `target_shape`'s, `InvalidConfig` for a non-finite scale.
pub fn delta(factors: &AdapterFactors, strength: f32, target_shape: &[usize]) -> Result<Tensor> {
    let scale = scale(factors, strength)?;
    let target_numel: usize = target_shape.iter().product();
    if factors.delta_numel() != target_numel {
        return Err(ComposeError::ShapeMismatch {
            expected: target_shape.to_vec(),
            actual: vec![factors.out_features(), factors.in_features()],
        });
    }
    let product = dense_product(factors)?;
    Ok(product
        .affine(f64::from(scale), 0.0)?
        .reshape(target_shape.to_vec())?)
}

/// Low-rank form used by dynamic composition: `(up, scale · [mid ×] down)`.
///
/// The mid factor and the scale are folded into the down side so that
/// `up × down'` equals the dense delta.
///
/// # Errors
/// Returns `InvalidConfig` for a non-finite scale, or error if a matmul fails.
pub fn low_rank_pair(factors: &AdapterFactors, strength: f32) -> Result<(Tensor, Tensor)> {
    let scale = scale(factors, strength)?;
    let down = match factors.mid() {
        Some(mid) => mid.matmul(factors.down())?,
        None => factors.down().clone(),
    };
    Ok((factors.up().clone(), down.affine(f64::from(scale), 0.0)?))
}
