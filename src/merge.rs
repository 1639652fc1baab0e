//! Static merge: adapters folded irreversibly into a copy of the base weight.
//!
//! Every merge writes into a fresh buffer. A failing adapter is logged,
//! recorded and skipped; the rest of the stack still applies.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::delta::delta;
use crate::error::{ComposeError, Result};
use crate::quantization::{add_saturating, quantize_delta, QuantizedWeight, RoundingMode};
use crate::stack::AdapterEntry;
use crate::store::{AdapterFactors, AdapterStore};
use crate::weights::{ModelWeights, Weight};

/// Which representation the merged weight should take.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Keep each target's own representation.
    #[default]
    Auto,
    /// Merge in the quantized domain. Float targets fall back to a float merge.
    Quantized,
    /// Dequantize quantized targets and merge in float.
    Float,
}

/// Options for a static merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Target representation policy.
    #[serde(default)]
    pub mode: MergeMode,
    /// Rounding used when adding into quantized weights.
    #[serde(default)]
    pub rounding: RoundingMode,
    /// Base seed for stochastic rounding.
    #[serde(default)]
    pub seed: u64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            mode: MergeMode::Auto,
            rounding: RoundingMode::Stochastic,
            seed: 0,
        }
    }
}

/// An adapter that could not be merged into one weight.
#[derive(Debug)]
pub struct MergeFailure {
    /// Position of the adapter in the merged list.
    pub index: usize,
    /// Why it was skipped.
    pub error: ComposeError,
}

/// Result of merging a list of adapters into one weight.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The new weight.
    pub weight: Weight,
    /// Number of adapters that contributed.
    pub applied: usize,
    /// Adapters that were skipped.
    pub failures: Vec<MergeFailure>,
    /// Whether a quantized merge was requested on a float target.
    pub fell_back: bool,
}

/// Derive an independent seed for stream `stream` of `seed` (splitmix64).
#[must_use]
pub fn mix_seed(seed: u64, stream: u64) -> u64 {
    let mut z = seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Merge `adapters` (factors, strength) into a copy of `base`.
///
/// Float targets accumulate `base + Σ delta` in f32 and are cast back to their
/// dtype. Quantized targets get each delta rounded onto their own scale (seed
/// `mix_seed(options.seed, i)` for adapter `i`), summed in `i32` and clamped
/// once. `base` itself is never modified.
///
/// # Errors
/// Only fails if the base weight itself cannot be read or rebuilt; per-adapter
/// errors are reported in [`MergeOutcome::failures`].
pub fn merge_weight(
    base: &Weight,
    adapters: &[(&AdapterFactors, f32)],
    options: &MergeOptions,
) -> Result<MergeOutcome> {
    let mut failures = Vec::new();

    let outcome = match (base, options.mode) {
        (Weight::Float(tensor), mode) => {
            let fell_back = mode == MergeMode::Quantized;
            if fell_back {
                let err = ComposeError::QuantizationMismatch(format!(
                    "target is {:?}, not quantized",
                    tensor.dtype()
                ));
                tracing::warn!(error = %err, "falling back to float merge");
            }
            let (merged, applied) = merge_float(tensor, adapters, &mut failures)?;
            MergeOutcome {
                weight: Weight::Float(merged),
                applied,
                failures,
                fell_back,
            }
        }
        (Weight::Quantized(q), MergeMode::Float) => {
            let device = adapters
                .first()
                .map_or(Device::Cpu, |(f, _)| f.up().device().clone());
            let dequantized = q.dequantize(&device)?;
            let (merged, applied) = merge_float(&dequantized, adapters, &mut failures)?;
            MergeOutcome {
                weight: Weight::Float(merged),
                applied,
                failures,
                fell_back: false,
            }
        }
        (Weight::Quantized(q), _) => {
            let (merged, applied) = merge_quantized(q, adapters, options, &mut failures)?;
            MergeOutcome {
                weight: Weight::Quantized(merged),
                applied,
                failures,
                fell_back: false,
            }
        }
    };
    Ok(outcome)
}

fn merge_float(
    base: &Tensor,
    adapters: &[(&AdapterFactors, f32)],
    failures: &mut Vec<MergeFailure>,
) -> Result<(Tensor, usize)> {
    let shape = base.dims().to_vec();
    let mut acc = base.to_dtype(DType::F32)?;
    let mut applied = 0;

    for (index, (factors, strength)) in adapters.iter().enumerate() {
        let step = delta(factors, *strength, &shape)
            .and_then(|d| Ok(acc.add(&d.to_device(acc.device())?)?));
        match step {
            Ok(next) => {
                acc = next;
                applied += 1;
            }
            Err(error) => {
                tracing::warn!(index, error = %error, "skipping adapter in float merge");
                failures.push(MergeFailure { index, error });
            }
        }
    }

    Ok((acc.to_dtype(base.dtype())?, applied))
}

fn merge_quantized(
    base: &QuantizedWeight,
    adapters: &[(&AdapterFactors, f32)],
    options: &MergeOptions,
    failures: &mut Vec<MergeFailure>,
) -> Result<(QuantizedWeight, usize)> {
    let shape = base.shape().to_vec();
    let mut deltas = Vec::with_capacity(adapters.len());

    for (index, (factors, strength)) in adapters.iter().enumerate() {
        let seed = mix_seed(options.seed, index as u64);
        let step = delta(factors, *strength, &shape)
            .and_then(|d| quantize_delta(&d, base.scale(), options.rounding, seed));
        match step {
            Ok(q) => deltas.push(q),
            Err(error) => {
                tracing::warn!(index, error = %error, "skipping adapter in quantized merge");
                failures.push(MergeFailure { index, error });
            }
        }
    }

    let applied = deltas.len();
    let data = add_saturating(base.data(), &deltas)?;
    Ok((base.with_data(data)?, applied))
}

/// An adapter from the stack that was not applied at all.
#[derive(Debug)]
pub struct SkippedAdapter {
    /// Adapter name from the stack entry.
    pub name: String,
    /// Why it was skipped.
    pub error: ComposeError,
}

/// One adapter that failed on one layer while applying elsewhere.
#[derive(Debug)]
pub struct LayerFailure {
    /// Model layer name.
    pub layer: String,
    /// Adapter name.
    pub adapter: String,
    /// Why the adapter was skipped for this layer.
    pub error: ComposeError,
}

/// Result of applying a whole stack to a model.
#[derive(Debug)]
pub struct StackApplication {
    /// New model weights; the input model is left untouched.
    pub weights: ModelWeights,
    /// Adapters that contributed to at least one layer, in stack order.
    pub applied: Vec<String>,
    /// Adapters that could not be loaded or matched no layer.
    pub skipped: Vec<SkippedAdapter>,
    /// Per-layer adapter failures.
    pub layer_failures: Vec<LayerFailure>,
    /// Number of layers whose weight changed.
    pub layers_patched: usize,
    /// Tags of every resolvable entry, joined with `", "`.
    pub tags: String,
}

/// Load every entry of a stack from `store` and merge it into a copy of `model`.
///
/// Adapter layers are matched to model layers through normalized keys. Load
/// failures are logged and skipped. Each model layer is merged with seed
/// `mix_seed(options.seed, layer_position)` so results are reproducible.
#[must_use]
pub fn apply_stack(
    model: &ModelWeights,
    entries: &[AdapterEntry],
    store: &dyn AdapterStore,
    options: &MergeOptions,
) -> StackApplication {
    let mut skipped = Vec::new();
    let mut tags = Vec::new();
    let mut loaded = Vec::new();

    for entry in entries {
        match store.load(&entry.name) {
            Ok(adapter) => {
                if let Some(tag) = &entry.tag {
                    tags.push(tag.as_str());
                }
                loaded.push((entry, adapter));
            }
            Err(error) => {
                if !matches!(error, ComposeError::NotFound { .. }) {
                    if let Some(tag) = &entry.tag {
                        tags.push(tag.as_str());
                    }
                }
                tracing::warn!(adapter = %entry.name, error = %error, "skipping adapter");
                skipped.push(SkippedAdapter {
                    name: entry.name.clone(),
                    error,
                });
            }
        }
    }

    // model layer name -> [(loaded index, factors)]
    let mut targets: BTreeMap<&str, Vec<(usize, Arc<AdapterFactors>)>> = BTreeMap::new();
    for (idx, (entry, adapter)) in loaded.iter().enumerate() {
        let mut unmatched = 0usize;
        for (key, factors) in adapter.layers() {
            match model.resolve(key) {
                Some(name) => targets
                    .entry(name)
                    .or_default()
                    .push((idx, Arc::clone(factors))),
                None => unmatched += 1,
            }
        }
        if unmatched > 0 {
            tracing::debug!(adapter = %entry.name, unmatched, "adapter layers with no model target");
        }
    }

    let mut weights = ModelWeights::new(model.device().clone());
    let mut contributed = BTreeSet::new();
    let mut layer_failures = Vec::new();
    let mut layers_patched = 0;

    for (position, (name, base)) in model.iter().enumerate() {
        let Some(layer_targets) = targets.get(name) else {
            weights.insert(name, base.clone());
            continue;
        };

        let pairs: Vec<(&AdapterFactors, f32)> = layer_targets
            .iter()
            .map(|(idx, f)| (f.as_ref(), loaded[*idx].0.strength))
            .collect();
        let layer_options = MergeOptions {
            seed: mix_seed(options.seed, position as u64),
            ..options.clone()
        };

        match merge_weight(base, &pairs, &layer_options) {
            Ok(outcome) => {
                let failed: BTreeSet<usize> = outcome.failures.iter().map(|f| f.index).collect();
                for (i, (idx, _)) in layer_targets.iter().enumerate() {
                    if !failed.contains(&i) {
                        contributed.insert(*idx);
                    }
                }
                for failure in outcome.failures {
                    layer_failures.push(LayerFailure {
                        layer: name.to_string(),
                        adapter: loaded[layer_targets[failure.index].0].0.name.clone(),
                        error: failure.error,
                    });
                }
                if outcome.applied > 0 {
                    layers_patched += 1;
                }
                weights.insert(name, outcome.weight);
            }
            Err(error) => {
                tracing::warn!(layer = name, error = %error, "layer merge failed, keeping base weight");
                weights.insert(name, base.clone());
            }
        }
    }

    let mut applied = Vec::new();
    for (idx, (entry, _)) in loaded.iter().enumerate() {
        if contributed.contains(&idx) {
            applied.push(entry.name.clone());
        } else {
            skipped.push(SkippedAdapter {
                name: entry.name.clone(),
                error: ComposeError::InvalidConfig(format!(
                    "adapter {} patched no model layer",
                    entry.name
                )),
            });
        }
    }

    tracing::info!(
        applied = applied.len(),
        skipped = skipped.len(),
        layers_patched,
        "applied adapter stack"
    );

    StackApplication {
        weights,
        applied,
        skipped,
        layer_failures,
        layers_patched,
        tags: tags.join(", "),
    }
}
