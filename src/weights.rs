//! Weight representations targeted by composition.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::quantization::QuantizedWeight;
use crate::store::normalize_layer_key;

/// A layer weight, continuous or int8-quantized.
#[derive(Debug, Clone)]
pub enum Weight {
    /// Float tensor (f32, f16 or bf16).
    Float(Tensor),
    /// Int8 data with a scale.
    Quantized(QuantizedWeight),
}

impl Weight {
    /// Shape of the weight.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Float(t) => t.dims().to_vec(),
            Self::Quantized(q) => q.shape().to_vec(),
        }
    }

    /// Whether the weight is stored quantized.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }

    /// Float view of the weight; quantized weights are dequantized onto `device`.
    ///
    /// # Errors
    /// Returns error if dequantization fails.
    pub fn to_float(&self, device: &Device) -> Result<Tensor> {
        match self {
            Self::Float(t) => Ok(t.clone()),
            Self::Quantized(q) => q.dequantize(device),
        }
    }
}

impl From<Tensor> for Weight {
    fn from(t: Tensor) -> Self {
        Self::Float(t)
    }
}

impl From<QuantizedWeight> for Weight {
    fn from(q: QuantizedWeight) -> Self {
        Self::Quantized(q)
    }
}

/// Named layer weights of one model.
///
/// Layers keep the names they were inserted with; lookups also accept
/// adapter-style keys via [`normalize_layer_key`].
#[derive(Debug, Clone)]
pub struct ModelWeights {
    layers: BTreeMap<String, Weight>,
    index: HashMap<String, String>,
    device: Device,
}

impl ModelWeights {
    /// Create an empty model on `device`.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            layers: BTreeMap::new(),
            index: HashMap::new(),
            device,
        }
    }

    /// Insert or replace a layer.
    pub fn insert(&mut self, name: impl Into<String>, weight: impl Into<Weight>) {
        let name = name.into();
        self.index.insert(normalize_layer_key(&name), name.clone());
        self.layers.insert(name, weight.into());
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, weight: impl Into<Weight>) -> Self {
        self.insert(name, weight);
        self
    }

    /// Weight stored under exactly `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Weight> {
        self.layers.get(name)
    }

    /// Model layer name matching an adapter or model key.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<&str> {
        if let Some((name, _)) = self.layers.get_key_value(key) {
            return Some(name.as_str());
        }
        self.index.get(&normalize_layer_key(key)).map(String::as_str)
    }

    /// Iterate over `(name, weight)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Weight)> {
        self.layers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the model has no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Device used for dequantization and new tensors.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}
