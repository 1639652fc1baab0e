//! Adapter factor storage.
//!
//! Decodes named adapters into per-layer low-rank factors. Two key layouts are
//! understood:
//!
//! ```text
//! kohya:  <layer>.lora_up.weight   [out, r]     PEFT:  <layer>.lora_B.weight  [out, r]
//!         <layer>.lora_down.weight [r, in]             <layer>.lora_A.weight  [r, in]
//!         <layer>.lora_mid.weight  [r, r]   (optional)
//!         <layer>.alpha            scalar   (optional)
//! ```
//!
//! Convolution factors are flattened to matrices on load: `up` to `[out, r]` and
//! `down` to `[r, in * kh * kw]`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::error::{ComposeError, Result};

/// Key prefixes stripped when matching adapter layers to model layers.
const LAYER_PREFIXES: &[&str] = &[
    "base_model.model.",
    "lora_unet_",
    "lora_te1_",
    "lora_te2_",
    "lora_te_",
    "model.",
    "diffusion_model.",
];

/// Low-rank factors of one adapter for one target layer.
#[derive(Debug, Clone)]
pub struct AdapterFactors {
    up: Tensor,
    down: Tensor,
    mid: Option<Tensor>,
    alpha: Option<f32>,
}

impl AdapterFactors {
    /// Build a factor set, flattening higher-rank tensors to matrices and
    /// converting to f32.
    ///
    /// # Errors
    /// Returns `CorruptFactors` if any factor is not at least 2-D, has a zero
    /// dimension, or if the inner dimensions do not chain
    /// (`up [out, r1] × mid [r1, r2] × down [r2, in]`, or `r1 == r2` without mid).
    pub fn new(up: Tensor, down: Tensor, mid: Option<Tensor>, alpha: Option<f32>) -> Result<Self> {
        let up = to_matrix(&up, "up")?;
        let down = to_matrix(&down, "down")?;
        let mid = mid.map(|m| to_matrix(&m, "mid")).transpose()?;

        let (out_features, up_rank) = up.dims2()?;
        let (rank, in_features) = down.dims2()?;
        if out_features == 0 || up_rank == 0 || rank == 0 || in_features == 0 {
            return Err(ComposeError::CorruptFactors(format!(
                "degenerate factor shapes: up {:?}, down {:?}",
                up.dims(),
                down.dims()
            )));
        }

        match &mid {
            Some(m) => {
                let dims = m.dims2()?;
                if dims != (up_rank, rank) {
                    return Err(ComposeError::CorruptFactors(format!(
                        "mid factor {:?} does not chain up rank {up_rank} to down rank {rank}",
                        m.dims()
                    )));
                }
            }
            None if up_rank != rank => {
                return Err(ComposeError::CorruptFactors(format!(
                    "rank mismatch: up has {up_rank}, down has {rank}"
                )));
            }
            None => {}
        }

        if let Some(a) = alpha {
            if !a.is_finite() {
                return Err(ComposeError::CorruptFactors(format!("non-finite alpha {a}")));
            }
        }

        Ok(Self {
            up,
            down,
            mid,
            alpha,
        })
    }

    /// Up-projection, `[out, r]`.
    #[must_use]
    pub fn up(&self) -> &Tensor {
        &self.up
    }

    /// Down-projection, `[rank, in]`.
    #[must_use]
    pub fn down(&self) -> &Tensor {
        &self.down
    }

    /// Optional mid-projection, `[r_up, rank]`.
    #[must_use]
    pub fn mid(&self) -> Option<&Tensor> {
        self.mid.as_ref()
    }

    /// Stored alpha, if any.
    #[must_use]
    pub fn alpha(&self) -> Option<f32> {
        self.alpha
    }

    /// Rank, taken from the leading dimension of `down`.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.down.dims()[0]
    }

    /// Rows of the patched weight.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.up.dims()[0]
    }

    /// Flattened columns of the patched weight.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.down.dims()[1]
    }

    /// Number of elements of the dense delta.
    #[must_use]
    pub fn delta_numel(&self) -> usize {
        self.out_features() * self.in_features()
    }
}

fn to_matrix(tensor: &Tensor, role: &str) -> Result<Tensor> {
    let dims = tensor.dims().to_vec();
    if dims.len() < 2 {
        return Err(ComposeError::CorruptFactors(format!(
            "{role} factor must be at least 2-D, got {dims:?}"
        )));
    }
    let tensor = tensor.to_dtype(DType::F32)?;
    if dims.len() == 2 {
        return Ok(tensor);
    }
    let rows = dims[0];
    let cols: usize = dims[1..].iter().product();
    Ok(tensor.reshape((rows, cols))?)
}

/// A named adapter: factors for every layer it patches, keyed by normalized
/// layer key.
#[derive(Debug, Clone)]
pub struct Adapter {
    name: String,
    layers: BTreeMap<String, Arc<AdapterFactors>>,
}

impl Adapter {
    /// Create an adapter with no layers.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: BTreeMap::new(),
        }
    }

    /// Create an adapter patching a single layer.
    #[must_use]
    pub fn single(name: impl Into<String>, layer_key: &str, factors: AdapterFactors) -> Self {
        Self::new(name).with_layer(layer_key, factors)
    }

    /// Add a layer, builder style.
    #[must_use]
    pub fn with_layer(mut self, layer_key: &str, factors: AdapterFactors) -> Self {
        self.insert_layer(layer_key, factors);
        self
    }

    /// Add or replace a layer.
    pub fn insert_layer(&mut self, layer_key: &str, factors: AdapterFactors) {
        self.layers
            .insert(normalize_layer_key(layer_key), Arc::new(factors));
    }

    /// Decode an adapter from a flat tensor map as read from a safetensors file.
    ///
    /// # Errors
    /// Returns `CorruptFactors` if a layer lacks an up or down factor, carries a
    /// factor twice, has inconsistent ranks, if two layers normalize to the
    /// same key, or if no layer is found at all.
    pub fn from_tensors(name: &str, tensors: HashMap<String, Tensor>) -> Result<Self> {
        #[derive(Default)]
        struct RawLayer {
            up: Option<Tensor>,
            down: Option<Tensor>,
            mid: Option<Tensor>,
            alpha: Option<Tensor>,
        }

        let mut grouped: BTreeMap<String, RawLayer> = BTreeMap::new();
        let mut ignored = 0usize;

        for (key, tensor) in tensors {
            let Some((prefix, role)) = split_factor_key(&key) else {
                ignored += 1;
                continue;
            };
            let raw = grouped.entry(prefix.to_string()).or_default();
            let slot = match role {
                FactorRole::Up => &mut raw.up,
                FactorRole::Down => &mut raw.down,
                FactorRole::Mid => &mut raw.mid,
                FactorRole::Alpha => &mut raw.alpha,
            };
            if slot.replace(tensor).is_some() {
                return Err(ComposeError::CorruptFactors(format!(
                    "layer {prefix} carries {role:?} factor twice"
                )));
            }
        }

        if ignored > 0 {
            tracing::debug!(adapter = name, ignored, "ignored non-LoRA tensors");
        }
        if grouped.is_empty() {
            return Err(ComposeError::CorruptFactors(format!(
                "{name}: no low-rank factors found"
            )));
        }

        let mut adapter = Self::new(name);
        for (prefix, raw) in grouped {
            let (Some(up), Some(down)) = (raw.up, raw.down) else {
                return Err(ComposeError::CorruptFactors(format!(
                    "{name}: layer {prefix} lacks an up or down factor"
                )));
            };
            let alpha = raw.alpha.map(|a| scalar_value(&a)).transpose()?;
            let factors = AdapterFactors::new(up, down, raw.mid, alpha)
                .map_err(|e| ComposeError::CorruptFactors(format!("{name}: layer {prefix}: {e}")))?;
            if adapter.layer(&prefix).is_some() {
                return Err(ComposeError::CorruptFactors(format!(
                    "{name}: layer {prefix} collides with another layer as {}",
                    normalize_layer_key(&prefix)
                )));
            }
            adapter.insert_layer(&prefix, factors);
        }
        Ok(adapter)
    }

    /// Adapter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Factors for a layer, matched by normalized key.
    #[must_use]
    pub fn layer(&self, layer_key: &str) -> Option<&Arc<AdapterFactors>> {
        self.layers.get(&normalize_layer_key(layer_key))
    }

    /// Iterate over `(normalized key, factors)` pairs.
    pub fn layers(&self) -> impl Iterator<Item = (&str, &Arc<AdapterFactors>)> {
        self.layers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of patched layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the adapter patches no layer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum FactorRole {
    Up,
    Down,
    Mid,
    Alpha,
}

fn split_factor_key(key: &str) -> Option<(&str, FactorRole)> {
    const SUFFIXES: &[(&str, FactorRole)] = &[
        (".lora_up.weight", FactorRole::Up),
        (".lora_B.weight", FactorRole::Up),
        (".lora_down.weight", FactorRole::Down),
        (".lora_A.weight", FactorRole::Down),
        (".lora_mid.weight", FactorRole::Mid),
        (".alpha", FactorRole::Alpha),
    ];
    SUFFIXES.iter().find_map(|(suffix, role)| {
        key.strip_suffix(suffix)
            .filter(|prefix| !prefix.is_empty())
            .map(|prefix| (prefix, *role))
    })
}

fn scalar_value(tensor: &Tensor) -> Result<f32> {
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    values
        .first()
        .copied()
        .ok_or_else(|| ComposeError::CorruptFactors("empty alpha tensor".into()))
}

/// Map adapter-style and model-style layer keys onto one form.
///
/// `lora_unet_down_blocks_0_proj_in` and `down_blocks.0.proj_in.weight` both
/// become `down_blocks_0_proj_in`.
#[must_use]
pub fn normalize_layer_key(key: &str) -> String {
    let mut k = key.trim();
    k = k.strip_suffix(".weight").unwrap_or(k);
    while let Some(rest) = LAYER_PREFIXES.iter().find_map(|p| k.strip_prefix(p)) {
        k = rest;
    }
    k.replace('.', "_")
}

/// Source of named adapters.
pub trait AdapterStore {
    /// Load the adapter registered under `name`.
    ///
    /// # Errors
    /// `NotFound` if nothing resolves for `name`, `CorruptFactors` if the
    /// stored tensors do not decode.
    fn load(&self, name: &str) -> Result<Adapter>;
}

/// Loads safetensors adapters from an ordered list of directories.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    device: Device,
}

impl DirectoryStore {
    /// Create a store searching `roots` in order for `.safetensors` files.
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            extensions: vec!["safetensors".to_string()],
            device: Device::Cpu,
        }
    }

    /// Replace the list of extensions tried when `name` has none.
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Load tensors onto `device`.
    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Search roots.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve `name` to a file path.
    ///
    /// Roots are tried in order; within a root the bare name wins over
    /// `name.ext`. Absolute names and names with `..` never resolve.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let safe = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return None;
        }

        self.roots.iter().find_map(|root| {
            let direct = root.join(relative);
            if direct.is_file() {
                return Some(direct);
            }
            self.extensions
                .iter()
                .map(|ext| root.join(format!("{name}.{ext}")))
                .find(|p| p.is_file())
        })
    }
}

impl AdapterStore for DirectoryStore {
    fn load(&self, name: &str) -> Result<Adapter> {
        let path = self.resolve(name).ok_or_else(|| ComposeError::NotFound {
            name: name.to_string(),
        })?;
        let tensors = candle_core::safetensors::load(&path, &self.device).map_err(|e| {
            ComposeError::CorruptFactors(format!("{}: {e}", path.display()))
        })?;
        let adapter = Adapter::from_tensors(name, tensors)?;
        tracing::debug!(
            adapter = name,
            path = %path.display(),
            layers = adapter.len(),
            "loaded adapter"
        );
        Ok(adapter)
    }
}

/// In-memory adapter store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    adapters: HashMap<String, Adapter>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn insert(&mut self, adapter: Adapter) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, adapter: Adapter) -> Self {
        self.insert(adapter);
        self
    }
}

impl AdapterStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Adapter> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| ComposeError::NotFound {
                name: name.to_string(),
            })
    }
}
