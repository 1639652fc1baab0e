//! Linear layer with a dynamically composed adapter delta.

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};

use crate::cache::ComposedFactors;
use crate::error::{ComposeError, Result};
use crate::weights::Weight;

/// Linear layer whose base weight stays untouched while the active adapter
/// stack is applied on the fly.
///
/// Computes `y = x @ Wᵀ + (x @ combined_downᵀ) @ combined_upᵀ + bias`.
/// Quantized base weights are dequantized per call unless caching is enabled.
#[derive(Debug)]
pub struct ComposedLinear {
    weight: Weight,
    cached_weight: Option<Tensor>,
    bias: Option<Tensor>,
    composed: Option<Arc<ComposedFactors>>,
    device: Device,
}

impl ComposedLinear {
    /// Wrap a 2-D base weight `[out, in]`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the weight is not 2-D.
    pub fn new(weight: impl Into<Weight>, bias: Option<Tensor>, device: &Device) -> Result<Self> {
        let weight = weight.into();
        let shape = weight.shape();
        if shape.len() != 2 {
            return Err(ComposeError::InvalidConfig(format!(
                "linear weight must be 2D, got {shape:?}"
            )));
        }
        Ok(Self {
            weight,
            cached_weight: None,
            bias,
            composed: None,
            device: device.clone(),
        })
    }

    /// Install the factors returned by
    /// [`CompositionSession::compose`](crate::CompositionSession::compose).
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the factors do not fit this layer.
    pub fn set_composition(&mut self, composed: Option<Arc<ComposedFactors>>) -> Result<()> {
        if let Some(c) = &composed {
            let expected = [self.out_features(), self.in_features()];
            let actual = [c.combined_up().dims()[0], c.combined_down().dims()[1]];
            if actual != expected {
                return Err(ComposeError::ShapeMismatch {
                    expected: expected.to_vec(),
                    actual: actual.to_vec(),
                });
            }
        }
        self.composed = composed;
        Ok(())
    }

    /// Currently installed factors.
    #[must_use]
    pub fn composition(&self) -> Option<&Arc<ComposedFactors>> {
        self.composed.as_ref()
    }

    /// Forward pass for `[batch, in]` or `[batch, seq, in]` input.
    ///
    /// # Errors
    /// Returns error if tensor operations fail
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let weight = match &self.cached_weight {
            Some(cached) => cached.clone(),
            None => self.weight.to_float(&self.device)?,
        };
        let weight_t = weight.to_dtype(input.dtype())?.t()?;

        let output = if input.dims().len() == 3 {
            let (batch, seq, in_features) = input.dims3()?;
            let flat = input.reshape((batch * seq, in_features))?;
            let mut out = flat.matmul(&weight_t)?;
            if let Some(composed) = &self.composed {
                out = out.add(&delta_output(composed, &flat)?)?;
            }
            out.reshape((batch, seq, self.out_features()))?
        } else {
            let out = input.matmul(&weight_t)?;
            match &self.composed {
                Some(composed) => out.add(&delta_output(composed, input)?)?,
                None => out,
            }
        };

        match &self.bias {
            Some(bias) => Ok(output.broadcast_add(&bias.to_dtype(output.dtype())?)?),
            None => Ok(output),
        }
    }

    /// Keep a dequantized copy of a quantized base weight.
    ///
    /// # Errors
    /// Returns error if dequantization fails.
    pub fn enable_weight_caching(&mut self) -> Result<()> {
        if self.cached_weight.is_none() && self.weight.is_quantized() {
            self.cached_weight = Some(self.weight.to_float(&self.device)?);
        }
        Ok(())
    }

    /// Drop the dequantized copy.
    pub fn disable_weight_caching(&mut self) {
        self.cached_weight = None;
    }

    /// Whether a dequantized copy is held.
    #[must_use]
    pub fn is_weight_cached(&self) -> bool {
        self.cached_weight.is_some()
    }

    /// Base weight.
    #[must_use]
    pub fn weight(&self) -> &Weight {
        &self.weight
    }

    /// Input width.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Output width.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

fn delta_output(composed: &ComposedFactors, input: &Tensor) -> Result<Tensor> {
    let out = composed.forward_delta(&input.to_dtype(DType::F32)?)?;
    Ok(out.to_dtype(input.dtype())?)
}

impl Module for ComposedLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        ComposedLinear::forward(self, xs).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}
