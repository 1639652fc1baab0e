//! Symmetric int8 weights and the bridge that adds float corrections to them.
//!
//! A quantized weight stores `data: i8` and a positive scale, per tensor or per
//! output channel (row along dimension 0). The represented value is
//! `data[i] * scale(i)`.
//!
//! Corrections are mapped into integer units with stochastic rounding: a value
//! `x` rounds up with probability `frac(x)`, so `E[round(x)] = x`. Plain
//! rounding would drop every correction smaller than half a step, which biases
//! stacks of small adjustments toward zero.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};

/// Smallest representable quantized value.
pub const QMIN: i32 = -128;

/// Largest representable quantized value.
pub const QMAX: i32 = 127;

/// Scale factor(s) of a quantized weight.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantScale {
    /// One scale for the whole tensor.
    PerTensor(f32),
    /// One scale per row along dimension 0.
    PerChannel(Vec<f32>),
}

impl QuantScale {
    /// Scale applying to `row`.
    #[must_use]
    pub fn row_scale(&self, row: usize) -> f32 {
        match self {
            Self::PerTensor(s) => *s,
            Self::PerChannel(scales) => scales[row],
        }
    }

    /// Check positivity and, for per-channel scales, that there is one per row
    /// of `shape`.
    ///
    /// # Errors
    /// Returns `Quantization` on a non-positive or non-finite scale, or a
    /// channel count that does not match `shape[0]`.
    pub fn validate(&self, shape: &[usize]) -> Result<()> {
        let scales: &[f32] = match self {
            Self::PerTensor(s) => std::slice::from_ref(s),
            Self::PerChannel(scales) => {
                if shape.first() != Some(&scales.len()) {
                    return Err(ComposeError::Quantization(format!(
                        "{} channel scales for shape {shape:?}",
                        scales.len()
                    )));
                }
                scales
            }
        };
        match scales.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            Some(bad) => Err(ComposeError::Quantization(format!(
                "scale must be positive and finite, got {bad}"
            ))),
            None => Ok(()),
        }
    }

    /// Number of elements per scale for a tensor of `numel` elements.
    fn group_len(&self, numel: usize) -> Result<usize> {
        match self {
            Self::PerTensor(_) => Ok(numel.max(1)),
            Self::PerChannel(scales) => {
                if scales.is_empty() || numel % scales.len() != 0 {
                    return Err(ComposeError::Quantization(format!(
                        "{numel} elements do not split into {} channels",
                        scales.len()
                    )));
                }
                Ok((numel / scales.len()).max(1))
            }
        }
    }
}

/// How float values are mapped onto the integer grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Unbiased stochastic rounding driven by a seed.
    #[default]
    Stochastic,
    /// Round half away from zero. Ignores the seed.
    Nearest,
}

/// An int8 weight with its scale.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    data: Vec<i8>,
    scale: QuantScale,
    shape: Vec<usize>,
}

impl QuantizedWeight {
    /// Build a quantized weight.
    ///
    /// # Errors
    /// Returns `Quantization` if `data` does not fill `shape` or the scale is
    /// invalid.
    pub fn new(data: Vec<i8>, scale: QuantScale, shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(ComposeError::Quantization(format!(
                "{} values for shape {shape:?}",
                data.len()
            )));
        }
        scale.validate(&shape)?;
        Ok(Self { data, scale, shape })
    }

    /// Quantize a float tensor with symmetric absmax scaling (`absmax / 127`),
    /// per tensor or per row.
    ///
    /// # Errors
    /// Returns error if the tensor cannot be read as f32 or is 0-D with
    /// `per_channel` set.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_float(tensor: &Tensor, per_channel: bool) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

        let absmax_scale = |block: &[f32]| {
            let absmax = block.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
            if absmax > 0.0 {
                absmax / QMAX as f32
            } else {
                1.0
            }
        };

        let scale = if per_channel {
            let rows = *shape.first().ok_or_else(|| {
                ComposeError::Quantization("per-channel quantization of a scalar".into())
            })?;
            let row_len = values.len() / rows.max(1);
            QuantScale::PerChannel(values.chunks(row_len.max(1)).map(absmax_scale).collect())
        } else {
            QuantScale::PerTensor(absmax_scale(&values))
        };

        let data = scaled_values(&values, &scale)?
            .into_iter()
            .map(|v| clamp_to_i8(v.round()))
            .collect();
        Self::new(data, scale, shape)
    }

    /// Represented float values, shaped like the weight.
    ///
    /// # Errors
    /// Returns error if tensor creation fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn dequantize(&self, device: &Device) -> Result<Tensor> {
        let group = self.scale.group_len(self.data.len())?;
        let values: Vec<f32> = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &q)| f32::from(q) * self.scale.row_scale(i / group))
            .collect();
        Ok(Tensor::from_vec(values, self.shape.clone(), device)?)
    }

    /// Same scale and shape, new data.
    pub(crate) fn with_data(&self, data: Vec<i8>) -> Result<Self> {
        Self::new(data, self.scale.clone(), self.shape.clone())
    }

    /// Quantized values.
    #[must_use]
    pub fn data(&self) -> &[i8] {
        &self.data
    }

    /// Scale factor(s).
    #[must_use]
    pub fn scale(&self) -> &QuantScale {
        &self.scale
    }

    /// Shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Memory size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let scales = match &self.scale {
            QuantScale::PerTensor(_) => 1,
            QuantScale::PerChannel(s) => s.len(),
        };
        self.data.len() + scales * 4
    }
}

/// Map a float delta into integer units of `scale` with stochastic rounding.
///
/// One uniform draw per element is taken, in row-major order, from a
/// `StdRng` seeded with `seed`, so identical inputs give identical outputs.
/// Results saturate to `[-128, 127]`.
///
/// # Errors
/// Returns `Quantization` if a scaled value is NaN or the scale does not
/// fit the delta's shape.
pub fn stochastic_round(delta: &Tensor, scale: &QuantScale, seed: u64) -> Result<Vec<i8>> {
    let values = delta.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let scaled = scaled_values(&values, scale)?;

    let mut rng = StdRng::seed_from_u64(seed);
    Ok(scaled
        .into_iter()
        .map(|v| {
            let floor = v.floor();
            let draw: f32 = rng.gen();
            let rounded = if draw < v - floor { floor + 1.0 } else { floor };
            clamp_to_i8(rounded)
        })
        .collect())
}

/// Map a float delta into integer units of `scale` with the given mode.
///
/// # Errors
/// Same as [`stochastic_round`].
pub fn quantize_delta(
    delta: &Tensor,
    scale: &QuantScale,
    mode: RoundingMode,
    seed: u64,
) -> Result<Vec<i8>> {
    match mode {
        RoundingMode::Stochastic => stochastic_round(delta, scale, seed),
        RoundingMode::Nearest => {
            let values = delta.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            Ok(scaled_values(&values, scale)?
                .into_iter()
                .map(|v| clamp_to_i8(v.round()))
                .collect())
        }
    }
}

/// Add quantized deltas to `base` in `i32` and clamp once to `[-128, 127]`.
///
/// # Errors
/// Returns `Quantization` if any delta's length differs from `base`'s.
pub fn add_saturating(base: &[i8], deltas: &[Vec<i8>]) -> Result<Vec<i8>> {
    if let Some(bad) = deltas.iter().find(|d| d.len() != base.len()) {
        return Err(ComposeError::Quantization(format!(
            "delta has {} values, weight has {}",
            bad.len(),
            base.len()
        )));
    }
    let mut acc: Vec<i32> = base.iter().map(|&q| i32::from(q)).collect();
    for d in deltas {
        for (a, &q) in acc.iter_mut().zip(d) {
            *a += i32::from(q);
        }
    }
    Ok(acc.into_iter().map(saturate).collect())
}

#[allow(clippy::cast_possible_truncation)]
fn saturate(a: i32) -> i8 {
    a.clamp(QMIN, QMAX) as i8
}

fn scaled_values(values: &[f32], scale: &QuantScale) -> Result<Vec<f32>> {
    let group = scale.group_len(values.len())?;
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            // overflow to ±inf is fine, it saturates in clamp_to_i8
            let scaled = v / scale.row_scale(i / group);
            if scaled.is_nan() {
                Err(ComposeError::Quantization(format!(
                    "value {v} at index {i} is not a number"
                )))
            } else {
                Ok(scaled)
            }
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn clamp_to_i8(v: f32) -> i8 {
    v.clamp(QMIN as f32, QMAX as f32) as i8
}
